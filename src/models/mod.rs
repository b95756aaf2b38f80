//! Core data models for the hierarchical view over a flat object store.
//!
//! Paths are pure values; buckets and objects describe what a store holds.

pub mod bucket;
pub mod object;
pub mod path;
