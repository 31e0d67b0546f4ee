//! Blob storage for Crystal.
//!
//! A storage backend maps a small integer blob id to a byte payload on one
//! physical medium. The storage router ([`StorageGroup`]) owns several
//! backends, each tagged with a random 16-bit storage id and a capacity, and
//! decides which backend receives a new blob.
//!
//! # Design Rules
//!
//! 1. Backends are stateless about the data-node tree: they only know
//!    `blob id -> bytes` plus their own usage accounting.
//! 2. Reads and deletes go to the backend named by the location's storage id.
//! 3. New blobs go to the least-loaded backend, re-evaluated every
//!    `rotation_threshold` bytes.
//! 4. The router's record list is persisted so storage ids embedded in datum
//!    slots survive a restart.

pub mod backend;
pub mod group;
pub mod simple;

pub use backend::StorageBackend;
pub use group::{usage_ratio, StorageGroup, StorageMapEntry, StorageRecord, StorageUsage};
pub use simple::{blob_path, SimpleStorage, METADATA_FILE};
