//! # Crystal
//!
//! An embedded, hierarchical object-persistence engine. Each registered
//! root object ("crystal") is kept in one checksummed snapshot file with an
//! optional backup copy. Tree-shaped roots keep their payloads in datum
//! slots persisted through a shared storage router, and every tree mutation
//! is journaled so changes made after the last snapshot survive a crash.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use crystal::{
//!     AbortPolicy, CrystalConfiguration, CrystalRegistry, Document, FilerConfiguration,
//!     RegistryConfiguration,
//! };
//!
//! # async fn run() -> crystal::CrystalResult<()> {
//! let registry = CrystalRegistry::builder(RegistryConfiguration::default())
//!     .register::<Document<Vec<String>>>(CrystalConfiguration::new(
//!         FilerConfiguration::local("/var/lib/app"),
//!         "names.bin",
//!     ))
//!     .build()?;
//! registry.prepare_and_load_all(&AbortPolicy).await?;
//!
//! let names = registry.object_for::<Document<Vec<String>>>().await?;
//! names.write().await.push("ada".into());
//! registry.save_and_terminate_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod handle;
pub mod object;
pub mod recovery;
pub mod registry;
pub mod snapshot;

pub use context::CrystalContext;
pub use handle::{CrystalHandle, Shared};
pub use object::{CrystalObject, Document};
pub use recovery::{AbortPolicy, ContinuePolicy, FnPolicy, RecoveryDecision, RecoveryPolicy};
pub use registry::{CrystalRegistry, CrystalRegistryBuilder, STORAGE_MAP_FILE};
pub use snapshot::{LoadedSnapshot, SnapshotTarget};

pub use crystal_checksum::Waypoint;
pub use crystal_data::{BlockDatum, DataNode, DataTree, FragmentDatum, ObjectDatum};
pub use crystal_types::{
    CrystalConfiguration, CrystalError, CrystalResult, FilerConfiguration, JournalConfiguration,
    RegistryConfiguration, StorageConfiguration,
};
