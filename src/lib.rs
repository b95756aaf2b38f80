//! Hierarchical filesystem semantics over a flat, prefix-addressed blob store.
//!
//! Object stores have no directories, no rename and no atomic multi-object
//! operations. [`BlobFileSystem`] synthesizes `mkdir`, recursive `delete`,
//! `rename` and single-level listings out of put/get/delete/list-by-prefix,
//! using zero-byte `dir/` marker objects and prefix listings to decide what
//! is a directory.
//!
//! ```no_run
//! use blobfs::{BlobFileSystem, CreateOptions, FsOptions, ObjectPath};
//! use blobfs::store::memory::InMemoryStore;
//! use std::sync::Arc;
//!
//! # async fn demo() -> blobfs::FsResult<()> {
//! let fs = BlobFileSystem::new(Arc::new(InMemoryStore::new()), FsOptions::default());
//! fs.create_bucket("photos").await?;
//! fs.mkdir(&ObjectPath::new("photos", "2025/", false)?).await?;
//!
//! let mut writer = fs
//!     .create(&ObjectPath::new("photos", "2025/a.jpg", false)?, CreateOptions::create_new())
//!     .await?;
//! writer.write(b"...");
//! writer.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod harness;
pub mod models;
pub mod services;
pub mod store;

pub use errors::{ErrorClass, FsError, FsResult, ItemFailure};
pub use models::{
    object::{FileInfo, ObjectInfo},
    path::{ObjectPath, PATH_DELIMITER, ancestor_prefixes, is_directory_path},
};
pub use services::{
    bulk::{BulkExecutor, TestBuckets, bulk_create, expand_subdirs, unique_name},
    channels::{CreateOptions, ObjectReader, ObjectWriter, ReadOptions},
    filesystem::{BlobFileSystem, FsOptions},
};
pub use store::{ObjectStore, WriteMode};
