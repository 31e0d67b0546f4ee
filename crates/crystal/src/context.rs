use std::sync::Arc;

use crystal_data::{DatumRegistry, MemoryUsage, TreeContext};
use crystal_journal::Journal;
use crystal_storage::StorageGroup;

/// Collaborators handed to a crystal when it is created or decoded.
#[derive(Clone, Debug)]
pub struct CrystalContext {
    pub datums: Arc<DatumRegistry>,
    pub storage: Arc<StorageGroup>,
    pub usage: Arc<MemoryUsage>,
    pub journal: Option<Arc<Journal>>,
    /// Journal token of the crystal this context belongs to.
    pub plane: u32,
}

impl CrystalContext {
    pub fn new(datums: Arc<DatumRegistry>, storage: Arc<StorageGroup>) -> Self {
        Self {
            datums,
            storage,
            usage: Arc::new(MemoryUsage::new()),
            journal: None,
            plane: 0,
        }
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_plane(mut self, plane: u32) -> Self {
        self.plane = plane;
        self
    }

    /// Context for a data-node tree journaling under this crystal's plane.
    pub fn tree_context(&self) -> TreeContext {
        TreeContext {
            registry: self.datums.clone(),
            storage: self.storage.clone(),
            usage: self.usage.clone(),
            journal: self.journal.clone().map(|j| (j, self.plane)),
        }
    }
}
