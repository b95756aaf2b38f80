//! Filesystem semantics layered over an [`ObjectStore`](crate::store::ObjectStore).

pub mod bulk;
pub mod channels;
pub mod filesystem;
