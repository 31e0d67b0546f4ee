//! Data-node tree for Crystal.
//!
//! A [`DataTree`] is a hierarchy of [`DataNode`]s. Each node owns typed
//! datum slots (at most one per datum type) and child nodes. Datum payloads
//! are persisted through a [`crystal_storage::StorageGroup`] and loaded
//! lazily on first access; the tree shape itself is captured with
//! [`DataTree::snapshot`] and, when a journal is attached, every creation,
//! slot flush and deletion is journaled for replay.
//!
//! # Locking
//!
//! Every node has its own async mutex. A parent is always locked before its
//! children, never the reverse.

pub mod block;
pub mod datum;
pub mod fragment;
pub mod memory;
pub mod node;
pub mod object;
pub mod record;
pub mod tree;

pub use block::BlockDatum;
pub use datum::{Datum, DatumRegistry};
pub use fragment::FragmentDatum;
pub use memory::MemoryUsage;
pub use node::{DataNode, DatumGuard};
pub use object::ObjectDatum;
pub use record::TreeRecord;
pub use tree::{DataTree, DatumSlot, NodeSnapshot, NodeState, SlotSnapshot, TreeContext, TreeSnapshot};
