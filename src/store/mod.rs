//! Flat object-store facade.
//!
//! The filesystem service only ever talks to a store through [`ObjectStore`]:
//! buckets, point put/get/head/delete by key, and prefix listings folded at a
//! delimiter. Two implementations ship with the crate:
//! - [`memory::InMemoryStore`] keeps everything in process (tests, fault injection)
//! - [`sqlite::SqliteStore`] keeps metadata in SQLite and payloads on disk

pub mod memory;
pub mod sqlite;

use crate::models::{bucket::Bucket, object::ObjectInfo};
use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::BTreeSet, io, ops::Range};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object `{key}` already exists in bucket `{bucket}`")]
    ObjectAlreadyExists { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// How `put` treats an existing object at the same key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `ObjectAlreadyExists` if the key is taken.
    CreateNew,
    /// Replace whatever is stored at the key.
    #[default]
    Overwrite,
}

#[derive(Clone, Debug, Default)]
pub struct ListParams {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub start_after: Option<String>,
    /// Upper bound on returned keys before delimiter folding.
    pub max_keys: Option<usize>,
}

impl ListParams {
    /// Single-level listing below `prefix`.
    pub fn folded(prefix: impl Into<String>, delimiter: &str) -> Self {
        Self {
            prefix: Some(prefix.into()),
            delimiter: Some(delimiter.to_string()),
            ..Self::default()
        }
    }

    /// Every key below `prefix`, at any depth.
    pub fn recursive(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub fn limit(mut self, max_keys: usize) -> Self {
        self.max_keys = Some(max_keys);
        self
    }
}

#[derive(Debug, Default)]
pub struct Listing {
    /// Objects directly matched, in key order.
    pub objects: Vec<ObjectInfo>,
    /// Folded prefixes, each ending with the delimiter, in key order.
    pub common_prefixes: Vec<String>,
}

impl Listing {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.common_prefixes.is_empty()
    }

    /// Fold a key-ordered run of objects according to `params`.
    pub fn fold(objects: impl IntoIterator<Item = ObjectInfo>, params: &ListParams) -> Self {
        let mut contents = Vec::new();
        let mut common_prefixes = BTreeSet::new();
        for obj in objects {
            if let Some(delim) = &params.delimiter {
                if let Some(prefix) =
                    compute_common_prefix(&obj.key, params.prefix.as_deref(), delim)
                {
                    common_prefixes.insert(prefix);
                    continue;
                }
            }
            contents.push(obj);
        }
        Self {
            objects: contents,
            common_prefixes: common_prefixes.into_iter().collect(),
        }
    }
}

/// Capability the filesystem layer needs from a blob store.
///
/// Implementations own their own synchronisation; callers never lock around
/// them. Conflicting writes to one key resolve by the store's create-if-absent
/// or last-writer-wins rule.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_bucket(&self, name: &str) -> StoreResult<Bucket>;

    /// Remove a bucket and every object in it.
    async fn delete_bucket(&self, name: &str) -> StoreResult<()>;

    async fn bucket_exists(&self, name: &str) -> StoreResult<bool>;

    async fn list_buckets(&self) -> StoreResult<Vec<Bucket>>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        mode: WriteMode,
    ) -> StoreResult<ObjectInfo>;

    /// Read an object, or the part of it covered by `range`.
    ///
    /// A range reaching past the end is truncated to the object size.
    async fn get(&self, bucket: &str, key: &str, range: Option<Range<u64>>) -> StoreResult<Bytes>;

    async fn head(&self, bucket: &str, key: &str) -> StoreResult<Option<ObjectInfo>>;

    /// Remove an object. Succeeds when nothing is stored at `key`.
    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<()>;

    async fn list(&self, bucket: &str, params: &ListParams) -> StoreResult<Listing>;

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        mode: WriteMode,
    ) -> StoreResult<ObjectInfo> {
        let data = self.get(src_bucket, src_key, None).await?;
        self.put(dst_bucket, dst_key, data, mode).await
    }
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

/// Reject keys no store accepts.
///
/// Empty keys, keys over 1024 bytes, keys starting with `/` and keys holding
/// control characters, backslashes or NULs are refused.
pub fn ensure_key_safe(key: &str) -> StoreResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN || key.starts_with('/') {
        return Err(StoreError::InvalidObjectKey(key.to_string()));
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(StoreError::InvalidObjectKey(key.to_string()));
    }
    Ok(())
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn ensure_bucket_name_safe(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }

    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }

    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }

    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }

    Ok(())
}

/// Compute a synthetic "common prefix" for S3 list semantics.
///
/// Returns Some(prefix) if the key folds into a deeper level below the
/// requested prefix, otherwise None.
fn compute_common_prefix(
    key: &str,
    requested_prefix: Option<&str>,
    delimiter: &str,
) -> Option<String> {
    let after_prefix = match requested_prefix {
        Some(prefix) => key.strip_prefix(prefix)?,
        None => key,
    };

    let pos = after_prefix.find(delimiter)?;
    let mut combined = String::new();
    if let Some(prefix) = requested_prefix {
        combined.push_str(prefix);
    }
    combined.push_str(&after_prefix[..pos + delimiter.len()]);
    Some(combined)
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}

/// Clamp `range` to an object of `size` bytes.
pub(crate) fn clamp_range(range: Option<Range<u64>>, size: u64) -> Range<u64> {
    match range {
        Some(r) => {
            let start = r.start.min(size);
            let end = r.end.clamp(start, size);
            start..end
        }
        None => 0..size,
    }
}
