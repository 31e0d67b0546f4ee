//! Foundation types for Crystal.
//!
//! This crate provides the result codes, identifiers and configuration
//! records shared by every other Crystal crate.
//!
//! # Key Types
//!
//! - [`CrystalError`]: the result code surfaced across every crate boundary
//! - [`StorageId`] / [`FileId`]: where a blob lives inside the storage router
//! - [`BlobLocation`]: the `(storage, file)` pair persisted in datum slots
//! - [`RegistryConfiguration`]: configuration consumed by the registry, built
//!   from [`FilerConfiguration`], [`CrystalConfiguration`] and friends
//! - [`BufferPool`]: recycler for scratch byte buffers

pub mod buffer;
pub mod config;
pub mod error;
pub mod id;

pub use buffer::BufferPool;
pub use config::{
    CrystalConfiguration, FilerConfiguration, JournalConfiguration, RegistryConfiguration,
    StorageConfiguration, StorageGroupConfiguration,
};
pub use error::{CrystalError, CrystalResult, ErrorClass};
pub use id::{BlobLocation, FileId, NodeId, StorageId};
