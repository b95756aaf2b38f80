//! Helpers shared by the contract tests.
//!
//! `IntegrationHelper` owns a filesystem handle plus two shared buckets and
//! wraps the write/read/verify steps the contract suite repeats. Every bucket
//! it creates is tagged by [`TestBuckets`], so `after_all_tests` sweeps them
//! even when a test bailed out halfway.

use crate::{
    errors::FsResult,
    models::path::{ObjectPath, PATH_DELIMITER},
    services::{
        bulk::{self, TestBuckets, unique_name},
        channels::CreateOptions,
        filesystem::BlobFileSystem,
    },
};
use anyhow::{Context, Result, ensure};
use tracing::{debug, warn};

pub struct IntegrationHelper {
    fs: BlobFileSystem,
    buckets: TestBuckets,
    /// Used by most tests.
    pub shared_bucket_1: String,
    /// Used by tests that need a second bucket, like cross-bucket renames.
    pub shared_bucket_2: String,
}

impl IntegrationHelper {
    pub fn new(fs: BlobFileSystem, buckets: TestBuckets) -> Self {
        let shared_bucket_1 = buckets.unique_bucket_name("shared-1");
        let shared_bucket_2 = buckets.unique_bucket_name("shared-2");
        Self {
            fs,
            buckets,
            shared_bucket_1,
            shared_bucket_2,
        }
    }

    pub fn fs(&self) -> &BlobFileSystem {
        &self.fs
    }

    pub fn buckets(&self) -> &TestBuckets {
        &self.buckets
    }

    /// Create both shared buckets.
    pub async fn before_all_tests(&self) -> Result<()> {
        for bucket in [&self.shared_bucket_1, &self.shared_bucket_2] {
            self.fs
                .create_bucket(bucket)
                .await
                .with_context(|| format!("creating shared bucket {}", bucket))?;
        }
        Ok(())
    }

    /// Delete every test bucket, shared ones included.
    pub async fn after_all_tests(&self) -> Result<usize> {
        let swept = self
            .buckets
            .cleanup(&self.fs)
            .await
            .context("failed to clean up test buckets")?;
        debug!("swept {} test buckets", swept);
        Ok(swept)
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    /// Write `text` to a new object; fails if it already exists.
    pub async fn write_text_file(&self, bucket: &str, object: &str, text: &str) -> Result<u64> {
        let path = ObjectPath::new(bucket, object, false)?;
        self.write_file(&path, text.as_bytes(), 1, false).await
    }

    /// Write `buffer` repeated `num_writes` times and check the stored size.
    pub async fn write_file(
        &self,
        path: &ObjectPath,
        buffer: &[u8],
        num_writes: usize,
        overwrite: bool,
    ) -> Result<u64> {
        let options = if overwrite {
            CreateOptions::overwrite()
        } else {
            CreateOptions::create_new()
        };
        let mut writer = self.fs.create(path, options).await?;
        let mut written = 0u64;
        for _ in 0..num_writes {
            written += writer.write(buffer) as u64;
        }
        let stored = writer.close().await?;

        let expected = (buffer.len() * num_writes) as u64;
        ensure!(
            written == expected && stored == expected,
            "write_file {}: wrote {} bytes, stored {}, expected {}",
            path,
            written,
            stored,
            expected
        );
        Ok(stored)
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    pub async fn read_text_file(&self, bucket: &str, object: &str) -> Result<String> {
        let path = ObjectPath::new(bucket, object, false)?;
        let bytes = self.read_file(&path).await?;
        String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", path))
    }

    pub async fn read_file(&self, path: &ObjectPath) -> Result<Vec<u8>> {
        let mut reader = self.fs.open(path).await?;
        Ok(reader.read_to_end().await?)
    }

    /// Read `len` bytes of text at `offset`.
    ///
    /// With `check_overflow` one extra byte is requested, so the call fails if
    /// the object continues past `offset + len`.
    pub async fn read_text_at(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        len: usize,
        check_overflow: bool,
    ) -> Result<String> {
        let path = ObjectPath::new(bucket, object, false)?;
        let mut buffer = vec![0u8; len + usize::from(check_overflow)];

        let mut reader = self.fs.open(&path).await?;
        if offset > 0 {
            reader.seek(offset);
        }
        let read = reader.read(&mut buffer).await?;
        ensure!(
            read == len,
            "read_text_at {}: read {} bytes, expected {}",
            path,
            read,
            len
        );

        buffer.truncate(read);
        String::from_utf8(buffer).with_context(|| format!("{} is not valid UTF-8", path))
    }

    // -----------------------------------------------------------------
    // Object sets
    // -----------------------------------------------------------------

    /// Size an object created by [`IntegrationHelper::create_objects`] must
    /// have. `None` means the object should not exist.
    pub fn expected_object_size(&self, name: &str, expected_to_exist: bool) -> Option<u64> {
        if !expected_to_exist {
            return None;
        }
        if name.is_empty() || name.ends_with(PATH_DELIMITER) {
            Some(0)
        } else {
            Some(name.len() as u64)
        }
    }

    /// Create `names` as given: directory names become markers, other names
    /// become files holding their own name.
    pub async fn create_objects<S: AsRef<str>>(&self, bucket: &str, names: &[S]) -> FsResult<usize> {
        bulk::bulk_create(&self.fs, bucket, names).await
    }

    /// Like [`IntegrationHelper::create_objects`], plus a marker for every
    /// intermediate directory.
    pub async fn create_objects_with_subdirs<S: AsRef<str>>(
        &self,
        bucket: &str,
        names: &[S],
    ) -> FsResult<usize> {
        bulk::create_objects_with_subdirs(&self.fs, bucket, names).await
    }

    // -----------------------------------------------------------------
    // Names and buckets
    // -----------------------------------------------------------------

    /// Fresh object path in the first shared bucket.
    pub fn unique_object_path(&self, prefix: &str) -> Result<ObjectPath> {
        Ok(ObjectPath::new(
            &self.shared_bucket_1,
            self.unique_object_name(prefix),
            false,
        )?)
    }

    pub fn unique_object_name(&self, prefix: &str) -> String {
        unique_name(prefix)
    }

    pub fn unique_bucket_name(&self, suffix: &str) -> String {
        self.buckets.unique_bucket_name(suffix)
    }

    /// Create a fresh test bucket; `after_all_tests` deletes it.
    pub async fn create_unique_bucket(&self, suffix: &str) -> Result<String> {
        let name = self.unique_bucket_name(suffix);
        self.fs
            .create_bucket(&name)
            .await
            .with_context(|| format!("creating bucket {}", name))?;
        Ok(name)
    }

    pub async fn clear_bucket(&self, bucket: &str) -> Result<()> {
        if let Err(err) = self.fs.clear_bucket(bucket).await {
            warn!("clearing {} failed: {}", bucket, err);
            return Err(err).with_context(|| format!("clearing bucket {}", bucket));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{services::filesystem::FsOptions, store::memory::InMemoryStore};
    use std::sync::Arc;

    fn helper() -> IntegrationHelper {
        let fs = BlobFileSystem::new(Arc::new(InMemoryStore::new()), FsOptions::default());
        IntegrationHelper::new(fs, TestBuckets::new("harness-test"))
    }

    #[test]
    fn expected_sizes_follow_object_names() {
        let h = helper();
        assert_eq!(h.expected_object_size("dir/", true), Some(0));
        assert_eq!(h.expected_object_size("", true), Some(0));
        assert_eq!(h.expected_object_size("dir/file", true), Some(8));
        assert_eq!(h.expected_object_size("dir/file", false), None);
    }

    #[tokio::test]
    async fn read_text_at_detects_overflow() {
        let h = helper();
        h.before_all_tests().await.unwrap();
        let bucket = h.shared_bucket_1.clone();

        h.write_text_file(&bucket, "greeting", "hello world").await.unwrap();
        assert_eq!(
            h.read_text_at(&bucket, "greeting", 6, 5, true).await.unwrap(),
            "world"
        );
        assert_eq!(
            h.read_text_at(&bucket, "greeting", 0, 5, false).await.unwrap(),
            "hello"
        );
        assert!(h.read_text_at(&bucket, "greeting", 0, 5, true).await.is_err());

        assert_eq!(h.after_all_tests().await.unwrap(), 2);
        assert!(!h.fs().bucket_exists(&bucket).await.unwrap());
    }

    #[tokio::test]
    async fn write_file_repeats_buffer() {
        let h = helper();
        h.before_all_tests().await.unwrap();
        let path = h.unique_object_path("repeat").unwrap();

        assert_eq!(h.write_file(&path, b"abc", 4, false).await.unwrap(), 12);
        assert!(h.write_file(&path, b"abc", 1, false).await.is_err());
        assert_eq!(h.write_file(&path, b"z", 2, true).await.unwrap(), 2);
        assert_eq!(h.read_file(&path).await.unwrap(), b"zz");
    }
}
