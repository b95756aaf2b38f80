//! Object metadata as reported by a store, and the filesystem view of it.

use crate::models::path::ObjectPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of a single stored object.
///
/// Content bytes are never carried here; read them through the store or an
/// `ObjectReader`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Bucket holding the object.
    pub bucket: String,

    /// Flat object key (may end with the delimiter for directory markers).
    pub key: String,

    /// Size in bytes.
    pub size: u64,

    /// MD5 of the content, lowercase hex.
    pub etag: Option<String>,

    /// Timestamp of the last write.
    pub last_modified: DateTime<Utc>,
}

impl ObjectInfo {
    /// Zero-byte object whose key ends with the delimiter.
    pub fn is_directory_marker(&self) -> bool {
        self.size == 0 && crate::models::path::is_directory_path(&self.key)
    }
}

/// What `stat` reports for a path.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub path: ObjectPath,
    pub size: u64,
    pub is_directory: bool,
    /// Missing for directories that exist only through their descendants.
    pub last_modified: Option<DateTime<Utc>>,
}

impl FileInfo {
    pub fn file(path: ObjectPath, object: &ObjectInfo) -> Self {
        Self {
            path,
            size: object.size,
            is_directory: false,
            last_modified: Some(object.last_modified),
        }
    }

    pub fn directory(path: ObjectPath, marker: Option<&ObjectInfo>) -> Self {
        Self {
            path,
            size: 0,
            is_directory: true,
            last_modified: marker.map(|m| m.last_modified),
        }
    }
}
