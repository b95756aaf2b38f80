use crate::store::StoreError;
use std::{fmt, time::Duration};
use thiserror::Error;

/// Errors surfaced by the filesystem layer.
///
/// Structural conflicts (`PathIsDirectory`, `PathIsFile`, `AlreadyExists`, ...)
/// mean the call itself is wrong for the current tree. `Store` and `Timeout`
/// are transient and may succeed on retry. `PartialFailure` means some items
/// of a bulk operation completed and the caller has to re-list to reconcile.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("`{0}` already exists")]
    AlreadyExists(String),
    #[error("`{0}` is a directory")]
    PathIsDirectory(String),
    #[error("`{0}` is a file")]
    PathIsFile(String),
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("directory `{0}` is not empty")]
    DirectoryNotEmpty(String),
    #[error("{operation}: {} of {total} items failed", .failures.len())]
    PartialFailure {
        operation: &'static str,
        total: usize,
        failures: Vec<ItemFailure>,
    },
    #[error("{operation}: {pending} items did not complete within {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
        pending: usize,
    },
    #[error("task for `{0}` did not run to completion")]
    TaskFailed(String),
    #[error(transparent)]
    Store(StoreError),
}

pub type FsResult<T> = Result<T, FsError>;

/// One failed item of a bulk operation.
#[derive(Debug)]
pub struct ItemFailure {
    pub name: String,
    pub error: FsError,
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.error)
    }
}

/// Coarse classification of an [`FsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The call conflicts with the tree; retrying will not help.
    Structural,
    /// Store or scheduling failure; a retry may succeed.
    Transient,
    /// Some work of a bulk operation completed.
    Partial,
}

impl FsError {
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FsError::InvalidPath { .. }
            | FsError::AlreadyExists(_)
            | FsError::PathIsDirectory(_)
            | FsError::PathIsFile(_)
            | FsError::NotFound(_)
            | FsError::DirectoryNotEmpty(_) => ErrorClass::Structural,
            FsError::PartialFailure { .. } => ErrorClass::Partial,
            FsError::Timeout { .. } | FsError::TaskFailed(_) | FsError::Store(_) => {
                ErrorClass::Transient
            }
        }
    }

    /// Names of the failed items when this is a `PartialFailure`.
    pub fn failed_items(&self) -> Vec<&str> {
        match self {
            FsError::PartialFailure { failures, .. } => {
                failures.iter().map(|f| f.name.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ObjectAlreadyExists { bucket, key } => {
                FsError::AlreadyExists(format!("{}/{}", bucket, key))
            }
            StoreError::ObjectNotFound { bucket, key } => {
                FsError::NotFound(format!("{}/{}", bucket, key))
            }
            StoreError::BucketNotFound(bucket) => FsError::NotFound(bucket),
            StoreError::BucketAlreadyExists(bucket) => FsError::AlreadyExists(bucket),
            StoreError::InvalidBucketName { name, reason } => FsError::InvalidPath {
                path: name,
                reason,
            },
            StoreError::InvalidObjectKey(key) => {
                FsError::invalid_path(key, "rejected by the object store")
            }
            other => FsError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflicts_become_structural() {
        let err: FsError = StoreError::ObjectAlreadyExists {
            bucket: "b".into(),
            key: "k".into(),
        }
        .into();
        assert!(matches!(err, FsError::AlreadyExists(ref p) if p == "b/k"));
        assert_eq!(err.class(), ErrorClass::Structural);

        let err: FsError = StoreError::Io(std::io::Error::other("reset")).into();
        assert!(matches!(err, FsError::Store(_)));
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn partial_failure_lists_items() {
        let err = FsError::PartialFailure {
            operation: "delete",
            total: 3,
            failures: vec![ItemFailure {
                name: "a/b".into(),
                error: FsError::TaskFailed("a/b".into()),
            }],
        };
        assert_eq!(err.class(), ErrorClass::Partial);
        assert_eq!(err.failed_items(), vec!["a/b"]);
        assert_eq!(err.to_string(), "delete: 1 of 3 items failed");
    }
}
