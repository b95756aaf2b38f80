//! Hierarchical paths over a flat `(bucket, key)` namespace.
//!
//! A path whose key is empty or ends with [`PATH_DELIMITER`] is a directory
//! path. Nothing here touches the store: whether a directory exists is decided
//! by the filesystem service from prefix listings.

use crate::errors::{FsError, FsResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delimiter used to fold flat keys into hierarchy levels.
pub const PATH_DELIMITER: &str = "/";

/// URI scheme accepted by [`ObjectPath::from_uri`].
pub const URI_SCHEME: &str = "blobfs";

/// A `(bucket, key)` pair addressing an object or a directory prefix.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectPath {
    bucket: String,
    key: String,
}

impl ObjectPath {
    /// Build a path from its components.
    ///
    /// Fails when the bucket is empty, when `key` starts with the delimiter,
    /// or when `key` is empty and `allow_empty_key` is false.
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        allow_empty_key: bool,
    ) -> FsResult<Self> {
        let bucket = bucket.into();
        let key = key.into();

        if bucket.is_empty() {
            return Err(FsError::invalid_path(
                format!("{}{}", PATH_DELIMITER, key),
                "bucket name must not be empty",
            ));
        }
        if bucket.contains(PATH_DELIMITER) {
            return Err(FsError::invalid_path(
                bucket,
                "bucket name must not contain the delimiter",
            ));
        }
        if key.is_empty() && !allow_empty_key {
            return Err(FsError::invalid_path(bucket, "object name must not be empty"));
        }
        if key.starts_with(PATH_DELIMITER) {
            return Err(FsError::invalid_path(
                format!("{}/{}", bucket, key),
                "object name must not start with the delimiter",
            ));
        }

        Ok(Self { bucket, key })
    }

    /// Root directory of a bucket.
    pub fn bucket_root(bucket: impl Into<String>) -> FsResult<Self> {
        Self::new(bucket, "", true)
    }

    /// Parse `blobfs://bucket/key` or the scheme-less `bucket/key`.
    pub fn from_uri(uri: &str, allow_empty_key: bool) -> FsResult<Self> {
        let rest = match uri.split_once("://") {
            Some((scheme, rest)) if scheme == URI_SCHEME => rest,
            Some((scheme, _)) => {
                return Err(FsError::invalid_path(
                    uri,
                    format!("unsupported scheme `{}`", scheme),
                ));
            }
            None => uri,
        };
        let (bucket, key) = rest.split_once(PATH_DELIMITER).unwrap_or((rest, ""));
        Self::new(bucket, key, allow_empty_key)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_root(&self) -> bool {
        self.key.is_empty()
    }

    pub fn is_directory_path(&self) -> bool {
        is_directory_path(&self.key)
    }

    /// Key with a trailing delimiter; empty for the bucket root.
    pub fn directory_key(&self) -> String {
        if self.is_directory_path() {
            self.key.clone()
        } else {
            format!("{}{}", self.key, PATH_DELIMITER)
        }
    }

    /// Key without a trailing delimiter; empty for the bucket root.
    pub fn file_key(&self) -> &str {
        self.key.strip_suffix(PATH_DELIMITER).unwrap_or(&self.key)
    }

    /// The same location addressed as a directory.
    pub fn to_directory(&self) -> Self {
        Self {
            bucket: self.bucket.clone(),
            key: self.directory_key(),
        }
    }

    /// The same location addressed as a file. The bucket root stays as is.
    pub fn to_file(&self) -> Self {
        Self {
            bucket: self.bucket.clone(),
            key: self.file_key().to_string(),
        }
    }

    /// Final segment of the key, without any trailing delimiter.
    pub fn name(&self) -> &str {
        let key = self.file_key();
        match key.rfind(PATH_DELIMITER) {
            Some(pos) => &key[pos + PATH_DELIMITER.len()..],
            None => key,
        }
    }

    /// Parent directory; `None` for the bucket root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let key = ancestor_prefixes(self.file_key())
            .pop()
            .unwrap_or_default();
        Some(Self {
            bucket: self.bucket.clone(),
            key,
        })
    }

    /// Append `name` below this path, treating it as a directory.
    pub fn child(&self, name: &str) -> FsResult<Self> {
        Self::new(
            self.bucket.clone(),
            format!("{}{}", self.directory_key(), name),
            false,
        )
    }

    /// Ancestor directory prefixes of this path's key, shallowest first.
    pub fn ancestors(&self) -> Vec<String> {
        ancestor_prefixes(self.file_key())
    }

    /// True if `other` lies strictly below this path when read as a directory.
    pub fn contains(&self, other: &ObjectPath) -> bool {
        let prefix = self.directory_key();
        self.bucket == other.bucket
            && other.key.len() > prefix.len()
            && other.key.starts_with(&prefix)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", URI_SCHEME, self.bucket, self.key)
    }
}

/// True iff `key` is empty or ends with the delimiter.
pub fn is_directory_path(key: &str) -> bool {
    key.is_empty() || key.ends_with(PATH_DELIMITER)
}

/// Every directory prefix above `key`, scanned left to right.
///
/// `foo/bar/zoo` yields `foo/`, `foo/bar/`; a key without a delimiter yields
/// nothing. A directory key does not list itself.
pub fn ancestor_prefixes(key: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = 0;
    while current < key.len() {
        let Some(index) = key[current..].find(PATH_DELIMITER) else {
            break;
        };
        let end = current + index + PATH_DELIMITER.len();
        if end == key.len() {
            break;
        }
        prefixes.push(key[..end].to_string());
        current = end;
    }
    prefixes
}
