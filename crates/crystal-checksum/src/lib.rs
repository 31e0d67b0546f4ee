//! Checksums for Crystal.
//!
//! Provides the domain-separated 64-bit content hash used for snapshots and
//! journal books, the fixed-layout [`Waypoint`] companion record, and CRC32
//! sealed frames for small metadata files.

pub mod hasher;
pub mod sealed;
pub mod waypoint;

pub use hasher::ContentHasher;
pub use sealed::{open, open_bincode, seal, seal_bincode};
pub use waypoint::{Waypoint, WAYPOINT_EXTENSION, WAYPOINT_LENGTH};
