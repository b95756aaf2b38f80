//! Hierarchical file and directory semantics over a flat object store.
//!
//! Directories are not stored state. A directory exists when a zero-byte
//! marker object `dir/` exists or when any key starts with `dir/`. `mkdir`
//! writes a marker for the requested directory only; ancestors are implied by
//! the marker's key.
//!
//! When a store holds both `K` and `K/`, the calling operation decides which
//! one it sees: `create`, `open`, `stat` and `delete` see the file, `mkdir`
//! and `list_children` see the directory. Nothing tries to repair that state.
//!
//! No locks are taken here. Racing writes to the same key are settled by the
//! store (create-if-absent or last writer wins).

use crate::{
    errors::{FsError, FsResult},
    models::{
        object::FileInfo,
        path::{ObjectPath, PATH_DELIMITER},
    },
    services::{
        bulk::BulkExecutor,
        channels::{CreateOptions, DEFAULT_READ_BUFFER_SIZE, ObjectReader, ObjectWriter, ReadOptions},
    },
    store::{ListParams, ObjectStore, StoreError, WriteMode},
};
use bytes::Bytes;
use futures::future::try_join_all;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Tuning knobs for the filesystem service.
#[derive(Clone, Debug)]
pub struct FsOptions {
    /// Upper bound on concurrently running items of a bulk operation.
    pub max_concurrency: usize,
    /// Deadline for joining all items of a bulk operation.
    pub join_timeout: Duration,
    /// Read-ahead buffer used by `open`.
    pub read_buffer_size: usize,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            join_timeout: Duration::from_secs(10),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

#[derive(Clone)]
pub struct BlobFileSystem {
    store: Arc<dyn ObjectStore>,
    options: FsOptions,
}

impl BlobFileSystem {
    pub fn new(store: Arc<dyn ObjectStore>, options: FsOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    pub fn bulk(&self) -> BulkExecutor {
        BulkExecutor::new(self.options.max_concurrency, self.options.join_timeout)
    }

    // -----------------------------------------------------------------
    // Buckets
    // -----------------------------------------------------------------

    pub async fn create_bucket(&self, name: &str) -> FsResult<()> {
        self.store.create_bucket(name).await?;
        info!("created bucket {}", name);
        Ok(())
    }

    /// Delete a bucket together with everything in it.
    pub async fn delete_bucket(&self, name: &str) -> FsResult<()> {
        self.store.delete_bucket(name).await?;
        info!("deleted bucket {}", name);
        Ok(())
    }

    pub async fn bucket_exists(&self, name: &str) -> FsResult<bool> {
        Ok(self.store.bucket_exists(name).await?)
    }

    /// Delete every object in a bucket, keeping the bucket.
    pub async fn clear_bucket(&self, name: &str) -> FsResult<()> {
        self.delete(&ObjectPath::bucket_root(name)?, true).await
    }

    // -----------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------

    /// Open `path` for writing.
    ///
    /// Fails with `PathIsDirectory` for directory paths and for keys that
    /// already have a directory below them, with `PathIsFile` when an
    /// ancestor segment is a file, and with `AlreadyExists` under
    /// `CreateNew` when the object exists. Ancestor markers are not written.
    pub async fn create(&self, path: &ObjectPath, options: CreateOptions) -> FsResult<ObjectWriter> {
        if path.is_directory_path() {
            return Err(FsError::PathIsDirectory(path.to_string()));
        }

        let existing = self.store.head(path.bucket(), path.key()).await?;
        match (&existing, options.write_mode) {
            (Some(_), WriteMode::CreateNew) => {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
            (Some(_), WriteMode::Overwrite) => {}
            (None, _) => {
                if self
                    .directory_exists(path.bucket(), &path.directory_key())
                    .await?
                {
                    return Err(FsError::PathIsDirectory(path.to_string()));
                }
            }
        }

        self.ensure_no_file_segment(path.bucket(), &path.ancestors(), false)
            .await?;

        debug!("opened {} for writing ({:?})", path, options.write_mode);
        Ok(ObjectWriter::new(
            self.store.clone(),
            path.clone(),
            options.write_mode,
        ))
    }

    pub async fn open(&self, path: &ObjectPath) -> FsResult<ObjectReader> {
        let options = ReadOptions {
            buffer_size: self.options.read_buffer_size,
            ..ReadOptions::default()
        };
        self.open_with(path, &options).await
    }

    pub async fn open_with(&self, path: &ObjectPath, options: &ReadOptions) -> FsResult<ObjectReader> {
        if path.is_directory_path() {
            return Err(FsError::PathIsDirectory(path.to_string()));
        }

        let mut size = None;
        if options.fast_fail_on_not_found {
            let Some(info) = self.store.head(path.bucket(), path.key()).await? else {
                if self
                    .directory_exists(path.bucket(), &path.directory_key())
                    .await?
                {
                    return Err(FsError::PathIsDirectory(path.to_string()));
                }
                return Err(FsError::NotFound(path.to_string()));
            };
            size = Some(info.size);
        }

        Ok(ObjectReader::new(
            self.store.clone(),
            path.clone(),
            size,
            options,
        ))
    }

    // -----------------------------------------------------------------
    // Directories
    // -----------------------------------------------------------------

    /// Create a directory, idempotently.
    ///
    /// Every segment of `path` is checked before anything is written: if one
    /// of them is an existing file (and not also a directory) the call fails
    /// with `PathIsFile` and the store is left untouched. A bucket root
    /// creates the bucket when it is missing.
    pub async fn mkdir(&self, path: &ObjectPath) -> FsResult<()> {
        if path.is_root() {
            return match self.store.create_bucket(path.bucket()).await {
                Ok(_) | Err(StoreError::BucketAlreadyExists(_)) => Ok(()),
                Err(err) => Err(err.into()),
            };
        }

        let mut segments = path.ancestors();
        segments.push(path.directory_key());
        self.ensure_no_file_segment(path.bucket(), &segments, true)
            .await?;

        let marker = path.directory_key();
        if self.store.head(path.bucket(), &marker).await?.is_some() {
            return Ok(());
        }
        match self
            .store
            .put(path.bucket(), &marker, Bytes::new(), WriteMode::CreateNew)
            .await
        {
            Ok(_) | Err(StoreError::ObjectAlreadyExists { .. }) => {
                debug!("mkdir {}", path);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Immediate children of a directory, sorted by key.
    ///
    /// Deeper keys fold into one directory entry. A file path that is not
    /// also a directory lists as itself.
    pub async fn list_children(&self, path: &ObjectPath) -> FsResult<Vec<ObjectPath>> {
        Ok(self
            .list_file_info(path)
            .await?
            .into_iter()
            .map(|info| info.path)
            .collect())
    }

    pub async fn list_file_info(&self, path: &ObjectPath) -> FsResult<Vec<FileInfo>> {
        let bucket = path.bucket();
        let dir_key = path.directory_key();
        let listing = self
            .store
            .list(bucket, &ListParams::folded(dir_key.clone(), PATH_DELIMITER))
            .await?;

        let mut has_marker = false;
        let mut children = Vec::with_capacity(listing.objects.len() + listing.common_prefixes.len());
        for object in &listing.objects {
            if object.key == dir_key {
                has_marker = true;
                continue;
            }
            let child = ObjectPath::new(bucket, object.key.clone(), false)?;
            children.push(FileInfo::file(child, object));
        }
        for prefix in listing.common_prefixes {
            let child = ObjectPath::new(bucket, prefix, false)?;
            children.push(FileInfo::directory(child, None));
        }

        if children.is_empty() && !has_marker && !path.is_root() {
            return match self.store.head(bucket, path.file_key()).await? {
                Some(object) if !path.is_directory_path() => {
                    Ok(vec![FileInfo::file(path.clone(), &object)])
                }
                _ => Err(FsError::NotFound(path.to_string())),
            };
        }

        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    pub async fn stat(&self, path: &ObjectPath) -> FsResult<FileInfo> {
        if path.is_root() {
            return if self.store.bucket_exists(path.bucket()).await? {
                Ok(FileInfo::directory(path.clone(), None))
            } else {
                Err(FsError::NotFound(path.to_string()))
            };
        }

        if !path.is_directory_path() {
            if let Some(object) = self.store.head(path.bucket(), path.key()).await? {
                return Ok(FileInfo::file(path.clone(), &object));
            }
        }

        let dir = path.to_directory();
        if let Some(marker) = self.store.head(dir.bucket(), dir.key()).await? {
            return Ok(FileInfo::directory(dir, Some(&marker)));
        }
        if self.directory_exists(dir.bucket(), dir.key()).await? {
            return Ok(FileInfo::directory(dir, None));
        }
        Err(FsError::NotFound(path.to_string()))
    }

    pub async fn exists(&self, path: &ObjectPath) -> FsResult<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn is_directory(&self, path: &ObjectPath) -> FsResult<bool> {
        match self.stat(path).await {
            Ok(info) => Ok(info.is_directory),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn is_file(&self, path: &ObjectPath) -> FsResult<bool> {
        match self.stat(path).await {
            Ok(info) => Ok(!info.is_directory),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    // -----------------------------------------------------------------
    // Delete / rename
    // -----------------------------------------------------------------

    /// Delete a file or a directory tree. Absent paths succeed, including
    /// paths in a bucket that does not exist.
    ///
    /// A non-empty directory needs `recursive`. Children are deleted through
    /// the bulk executor: every child is attempted, failures come back as one
    /// `PartialFailure`, and the directory marker is only removed once all
    /// children are gone. The tree is not removed atomically.
    pub async fn delete(&self, path: &ObjectPath, recursive: bool) -> FsResult<()> {
        let bucket = path.bucket();
        if !self.store.bucket_exists(bucket).await? {
            debug!("delete of {}: bucket does not exist", path);
            return Ok(());
        }

        if !path.is_directory_path() && self.store.head(bucket, path.key()).await?.is_some() {
            self.store.delete(bucket, path.key()).await?;
            debug!("deleted file {}", path);
            return Ok(());
        }

        let dir_key = path.directory_key();
        let listing = self
            .store
            .list(bucket, &ListParams::recursive(dir_key.clone()))
            .await?;

        let mut has_marker = false;
        let mut children = Vec::with_capacity(listing.objects.len());
        for object in listing.objects {
            if object.key == dir_key {
                has_marker = true;
            } else {
                children.push(object.key);
            }
        }

        if !children.is_empty() {
            if !recursive {
                return Err(FsError::DirectoryNotEmpty(path.to_string()));
            }
            let count = children.len();
            self.delete_keys("delete", bucket, children).await?;
            debug!("deleted {} objects below {}", count, path);
        }

        if has_marker {
            self.store.delete(bucket, &dir_key).await?;
        }
        Ok(())
    }

    /// Move a file or directory tree to `dst`. The source must exist; a file
    /// can not move to a path ending with the delimiter.
    ///
    /// Files are copied then deleted. Directories copy every object below
    /// the prefix, then delete the sources; if any copy fails the sources are
    /// left in place. Not atomic: a reader may observe both trees.
    pub async fn rename(&self, src: &ObjectPath, dst: &ObjectPath) -> FsResult<()> {
        if src.is_root() || dst.is_root() {
            return Err(FsError::invalid_path(
                src.to_string(),
                "bucket roots can not be renamed",
            ));
        }
        if src.contains(dst) {
            return Err(FsError::invalid_path(
                dst.to_string(),
                "destination is inside the source directory",
            ));
        }

        let source = self.stat(src).await?;
        if !source.is_directory && dst.is_directory_path() {
            return Err(FsError::invalid_path(
                dst.to_string(),
                "a file can not be renamed to a directory path",
            ));
        }
        if src.to_file() == dst.to_file() {
            return Ok(());
        }
        if self.exists(dst).await? {
            return Err(FsError::AlreadyExists(dst.to_string()));
        }

        if !source.is_directory {
            let dst = dst.to_file();
            self.ensure_no_file_segment(dst.bucket(), &dst.ancestors(), false)
                .await?;
            self.store
                .copy(
                    src.bucket(),
                    src.file_key(),
                    dst.bucket(),
                    dst.key(),
                    WriteMode::CreateNew,
                )
                .await?;
            self.store.delete(src.bucket(), src.file_key()).await?;
            debug!("renamed file {} to {}", src, dst);
            return Ok(());
        }

        let src_dir = src.directory_key();
        let dst_dir = dst.to_directory();
        let mut segments = dst_dir.ancestors();
        segments.push(dst_dir.key().to_string());
        self.ensure_no_file_segment(dst_dir.bucket(), &segments, true)
            .await?;

        let sources: Vec<String> = self
            .store
            .list(src.bucket(), &ListParams::recursive(src_dir.clone()))
            .await?
            .objects
            .into_iter()
            .map(|o| o.key)
            .collect();

        let store = self.store.clone();
        let src_bucket = src.bucket().to_string();
        let dst_bucket = dst_dir.bucket().to_string();
        let dst_prefix = dst_dir.key().to_string();
        let src_prefix = src_dir.clone();
        self.bulk()
            .run("rename-copy", sources.clone(), move |key| {
                let store = store.clone();
                let src_bucket = src_bucket.clone();
                let dst_bucket = dst_bucket.clone();
                let dst_key = format!("{}{}", dst_prefix, &key[src_prefix.len()..]);
                async move {
                    store
                        .copy(&src_bucket, &key, &dst_bucket, &dst_key, WriteMode::CreateNew)
                        .await?;
                    Ok(())
                }
            })
            .await?;

        let (markers, files): (Vec<String>, Vec<String>) =
            sources.into_iter().partition(|k| *k == src_dir);
        self.delete_keys("rename-delete", src.bucket(), files).await?;
        for marker in markers {
            self.store.delete(src.bucket(), &marker).await?;
        }
        debug!("renamed directory {} to {}", src, dst_dir);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    /// A directory exists when its marker or any key below it exists.
    async fn directory_exists(&self, bucket: &str, dir_key: &str) -> FsResult<bool> {
        if dir_key.is_empty() {
            return Ok(self.store.bucket_exists(bucket).await?);
        }
        let listing = self
            .store
            .list(bucket, &ListParams::recursive(dir_key).limit(1))
            .await?;
        Ok(!listing.is_empty())
    }

    /// Fail with `PathIsFile` if any of the directory `segments` exists as a
    /// file (the segment without its trailing delimiter). With
    /// `directory_wins`, a segment that is also a directory is accepted.
    async fn ensure_no_file_segment(
        &self,
        bucket: &str,
        segments: &[String],
        directory_wins: bool,
    ) -> FsResult<()> {
        let checks = segments.iter().map(|segment| async move {
            let file_key = segment.strip_suffix(PATH_DELIMITER).unwrap_or(segment);
            if file_key.is_empty() || self.store.head(bucket, file_key).await?.is_none() {
                return Ok::<_, FsError>(None);
            }
            if directory_wins && self.directory_exists(bucket, segment).await? {
                return Ok(None);
            }
            Ok(Some(file_key.to_string()))
        });

        let conflicts = try_join_all(checks).await?;
        match conflicts.into_iter().flatten().next() {
            Some(file_key) => {
                let path = ObjectPath::new(bucket, file_key, false)?;
                warn!("path segment {} is a file", path);
                Err(FsError::PathIsFile(path.to_string()))
            }
            None => Ok(()),
        }
    }

    async fn delete_keys(
        &self,
        operation: &'static str,
        bucket: &str,
        keys: Vec<String>,
    ) -> FsResult<usize> {
        let store = self.store.clone();
        let bucket = bucket.to_string();
        self.bulk()
            .run(operation, keys, move |key| {
                let store = store.clone();
                let bucket = bucket.clone();
                async move {
                    store.delete(&bucket, &key).await?;
                    Ok(())
                }
            })
            .await
    }
}
