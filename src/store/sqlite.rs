//! src/store/sqlite.rs
//!
//! Durable [`ObjectStore`] backed by SQLite for metadata and local disk for
//! object payloads. Payloads are named by object id and
//! sharded beneath `base_path/{bucket}/{shard}/{shard}/{id}`, so keys that
//! look like directories never collide with each other on disk.

use super::{
    ListParams, Listing, ObjectStore, StoreError, StoreResult, WriteMode, clamp_range,
    ensure_bucket_name_safe, ensure_key_safe,
};
use crate::models::{bucket::Bucket, object::ObjectInfo};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::{
    FromRow, QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    id BLOB PRIMARY KEY NOT NULL,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS objects (
    id BLOB PRIMARY KEY NOT NULL,
    bucket_id BLOB NOT NULL REFERENCES buckets(id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    etag TEXT,
    last_modified TEXT NOT NULL,
    UNIQUE(bucket_id, key)
);
CREATE INDEX IF NOT EXISTS idx_objects_bucket_key ON objects(bucket_id, key)
"#;

/// Metadata row for one object; `id` also names the payload file.
#[derive(FromRow, Debug)]
struct ObjectRow {
    id: Uuid,
    key: String,
    size_bytes: i64,
    etag: Option<String>,
    last_modified: DateTime<Utc>,
}

impl ObjectRow {
    fn into_info(self, bucket: &str) -> ObjectInfo {
        ObjectInfo {
            bucket: bucket.to_string(),
            key: self.key,
            size: self.size_bytes.max(0) as u64,
            etag: self.etag,
            last_modified: self.last_modified,
        }
    }
}

/// Payload file written to a temp location, not yet claimed by a row.
struct StagedPayload {
    id: Uuid,
    path: PathBuf,
    size_bytes: i64,
    etag: String,
}

#[derive(Clone)]
pub struct SqliteStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Open (creating if needed) the database at `database_url`, apply the
    /// schema, and make sure `base_path` exists.
    pub async fn connect(database_url: &str, base_path: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;

        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("file:");
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                info!("Created missing directory {:?}", parent);
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::new(Arc::new(db), base_path);
        store.run_migrations().await?;
        Ok(store)
    }

    /// Apply the embedded schema statement by statement.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Compute the physical base folder path for a bucket.
    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Two-level shard identifiers from MD5(bucket/id), as lowercase hex.
    fn object_shards(bucket_name: &str, id: &Uuid) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Payload path for an object id. Parent directories may not exist yet.
    fn object_path(&self, bucket_name: &str, id: &Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, id);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(id.to_string());
        path
    }

    async fn fetch_bucket(&self, bucket: &str) -> StoreResult<Bucket> {
        ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<Sqlite, Bucket>("SELECT id, name, created_at FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => bucket_not_found(bucket),
                other => StoreError::Sqlx(other),
            })
    }

    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StoreResult<Option<ObjectRow>> {
        let row = sqlx::query_as::<_, ObjectRow>(
            "SELECT id, key, size_bytes, etag, last_modified
             FROM objects WHERE bucket_id = ? AND key = ?",
        )
        .bind(bucket.id)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    /// Stream a payload into a temp file, then move it to its id-named path.
    ///
    /// Computes size and MD5 while streaming, fsyncs before the rename, and
    /// removes the temp file on any error.
    async fn stage_payload<S>(&self, bucket: &str, stream: S) -> StoreResult<StagedPayload>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let id = Uuid::new_v4();
        let file_path = self.object_path(bucket, &id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        let tmp_path = parent.join(format!(".tmp-{}", id));
        let mut file = create_payload_file(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        Ok(StagedPayload {
            id,
            path: file_path,
            size_bytes,
            etag: format!("{:x}", digest.compute()),
        })
    }

    /// Stream-upload an object and record its metadata.
    ///
    /// - `CreateNew` claims the key with a conditional insert; on conflict the
    ///   staged payload is discarded and the existing object is untouched.
    /// - `Overwrite` swaps the row to the new payload inside a transaction and
    ///   removes the replaced payload file afterwards.
    pub async fn put_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        stream: S,
        mode: WriteMode,
    ) -> StoreResult<ObjectInfo>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let staged = self.stage_payload(&bucket_rec.name, stream).await?;
        let last_modified = Utc::now();

        let result = match mode {
            WriteMode::CreateNew => self.insert_new(&bucket_rec, key, &staged, last_modified).await,
            WriteMode::Overwrite => self.upsert(&bucket_rec, key, &staged, last_modified).await,
        };

        match result {
            Ok((row, replaced)) => {
                if let Some(old_id) = replaced {
                    self.remove_payload(&bucket_rec.name, &old_id).await;
                }
                Ok(row.into_info(&bucket_rec.name))
            }
            Err(err) => {
                let _ = fs::remove_file(&staged.path).await;
                Err(err)
            }
        }
    }

    async fn insert_new(
        &self,
        bucket: &Bucket,
        key: &str,
        staged: &StagedPayload,
        last_modified: DateTime<Utc>,
    ) -> StoreResult<(ObjectRow, Option<Uuid>)> {
        let row = sqlx::query_as::<_, ObjectRow>(
            r#"
            INSERT INTO objects (id, bucket_id, key, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket_id, key) DO NOTHING
            RETURNING id, key, size_bytes, etag, last_modified
            "#,
        )
        .bind(staged.id)
        .bind(bucket.id)
        .bind(key)
        .bind(staged.size_bytes)
        .bind(&staged.etag)
        .bind(last_modified)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => Ok((row, None)),
            None => Err(StoreError::ObjectAlreadyExists {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            }),
        }
    }

    async fn upsert(
        &self,
        bucket: &Bucket,
        key: &str,
        staged: &StagedPayload,
        last_modified: DateTime<Utc>,
    ) -> StoreResult<(ObjectRow, Option<Uuid>)> {
        // The first statement writes, so the transaction takes the write lock
        // up front and waits on the busy timeout instead of failing an upgrade.
        let mut tx = self.db.begin().await?;

        let previous: Option<Uuid> = sqlx::query_scalar(
            "DELETE FROM objects WHERE bucket_id = ? AND key = ? RETURNING id",
        )
        .bind(bucket.id)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, ObjectRow>(
            r#"
            INSERT INTO objects (id, bucket_id, key, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, key, size_bytes, etag, last_modified
            "#,
        )
        .bind(staged.id)
        .bind(bucket.id)
        .bind(key)
        .bind(staged.size_bytes)
        .bind(&staged.etag)
        .bind(last_modified)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((row, previous))
    }

    /// Remove a payload file best-effort and prune emptied shard folders.
    async fn remove_payload(&self, bucket_name: &str, id: &Uuid) {
        let file_path = self.object_path(bucket_name, id);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => {
                debug!("failed to remove {}: {}", file_path.display(), err);
                return;
            }
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket_name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
    }

    /// Recursively remove empty directories up to bucket root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for SqliteStore {
    async fn create_bucket(&self, name: &str) -> StoreResult<Bucket> {
        ensure_bucket_name_safe(name)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let bucket = Bucket::new(name);
        match sqlx::query("INSERT INTO buckets (id, name, created_at) VALUES (?, ?, ?)")
            .bind(bucket.id)
            .bind(&bucket.name)
            .bind(bucket.created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    /// Delete bucket metadata (objects cascade) and its payload directory.
    async fn delete_bucket(&self, name: &str) -> StoreResult<()> {
        ensure_bucket_name_safe(name)?;
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "DELETE FROM objects WHERE bucket_id IN (SELECT id FROM buckets WHERE name = ?)",
        )
        .bind(name)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(bucket_not_found(name));
        }
        tx.commit().await?;

        let bucket_path = self.bucket_root(name);
        if let Err(err) = fs::remove_dir_all(&bucket_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove bucket directory {} after delete: {}",
                    bucket_path.display(),
                    err
                );
            }
        }
        Ok(())
    }

    async fn bucket_exists(&self, name: &str) -> StoreResult<bool> {
        match self.fetch_bucket(name).await {
            Ok(_) => Ok(true),
            Err(StoreError::BucketNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_buckets(&self) -> StoreResult<Vec<Bucket>> {
        let buckets = sqlx::query_as::<_, Bucket>(
            "SELECT id, name, created_at FROM buckets ORDER BY name ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(buckets)
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        mode: WriteMode,
    ) -> StoreResult<ObjectInfo> {
        let stream = futures::stream::once(async move { Ok::<_, io::Error>(data) });
        self.put_stream(bucket, key, stream, mode).await
    }

    async fn get(&self, bucket: &str, key: &str, range: Option<Range<u64>>) -> StoreResult<Bytes> {
        ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let row = self
            .fetch_object(&bucket_rec, key)
            .await?
            .ok_or_else(|| object_not_found(bucket, key))?;

        let range = clamp_range(range, row.size_bytes.max(0) as u64);
        let file_path = self.object_path(&bucket_rec.name, &row.id);
        let mut file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                object_not_found(bucket, key)
            } else {
                StoreError::Io(err)
            }
        })?;

        if range.start > 0 {
            file.seek(SeekFrom::Start(range.start)).await?;
        }
        let mut buf = Vec::with_capacity((range.end - range.start) as usize);
        file.take(range.end - range.start)
            .read_to_end(&mut buf)
            .await?;
        Ok(Bytes::from(buf))
    }

    async fn head(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectInfo>> {
        ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        Ok(self
            .fetch_object(&bucket_rec, key)
            .await?
            .map(|row| row.into_info(&bucket_rec.name)))
    }

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<()> {
        ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let removed: Option<Uuid> =
            sqlx::query_scalar("DELETE FROM objects WHERE bucket_id = ? AND key = ? RETURNING id")
                .bind(bucket_rec.id)
                .bind(key)
                .fetch_optional(&*self.db)
                .await?;

        if let Some(id) = removed {
            self.remove_payload(&bucket_rec.name, &id).await;
        }
        Ok(())
    }

    /// List objects in key order.
    ///
    /// Prefix matching compares the leading characters exactly (no LIKE
    /// wildcards), so `%` and `_` in keys are literal.
    async fn list(&self, bucket: &str, params: &ListParams) -> StoreResult<Listing> {
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, key, size_bytes, etag, last_modified FROM objects WHERE bucket_id = ",
        );
        builder.push_bind(bucket_rec.id);

        if let Some(prefix) = params.prefix.as_ref().filter(|p| !p.is_empty()) {
            builder.push(" AND substr(key, 1, ");
            builder.push_bind(prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(prefix.clone());
        }

        if let Some(after) = &params.start_after {
            builder.push(" AND key > ");
            builder.push_bind(after.clone());
        }

        builder.push(" ORDER BY key ASC");
        if let Some(limit) = params.max_keys {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows: Vec<ObjectRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(Listing::fold(
            rows.into_iter().map(|row| row.into_info(&bucket_rec.name)),
            params,
        ))
    }
}

fn bucket_not_found(name: &str) -> StoreError {
    StoreError::BucketNotFound(name.to_string())
}

fn object_not_found(bucket: &str, key: &str) -> StoreError {
    StoreError::ObjectNotFound {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }
}

/// Create a payload file, making its shard directories first.
///
/// A concurrent prune can remove an emptied shard directory between
/// `create_dir_all` and the create; that case is retried once.
async fn create_payload_file(path: &Path) -> io::Result<File> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
    fs::create_dir_all(parent).await?;
    match File::create(path).await {
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("shard directory {} vanished; recreating", parent.display());
            fs::create_dir_all(parent).await?;
            File::create(path).await
        }
        other => other,
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
