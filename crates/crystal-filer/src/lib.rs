//! Raw byte filers for Crystal.
//!
//! A filer maps a relative path to a byte payload on one physical medium. It
//! knows nothing about blob ids, journals or snapshots; those layers build on
//! top of the [`RawFiler`] trait.
//!
//! # Filers
//!
//! - [`LocalFiler`] -- a directory on the local file system
//! - [`BucketFiler`] -- a key prefix inside a remote bucket, reached through an
//!   injected [`BucketClient`]
//! - [`InMemoryBucket`] -- `HashMap`-based bucket client for tests and embedding
//!
//! [`FilerResolver`] turns a [`crystal_types::FilerConfiguration`] into a
//! filer handle.

pub mod bucket;
pub mod local;
pub mod resolver;
pub mod traits;

pub use bucket::{BucketClient, BucketFiler, InMemoryBucket};
pub use local::LocalFiler;
pub use resolver::FilerResolver;
pub use traits::{FileEntry, RawFiler};
