//! Root objects managed by the registry.

use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crystal_data::{DataTree, TreeSnapshot};
use crystal_journal::JournalRecord;
use crystal_types::{CrystalError, CrystalResult};

use crate::context::CrystalContext;

/// A root object persisted as one snapshot file.
#[async_trait]
pub trait CrystalObject: Send + Sync + Sized + 'static {
    /// Fresh instance used when no snapshot exists yet.
    fn create(context: &CrystalContext) -> Self;

    async fn encode(&self) -> CrystalResult<Bytes>;

    fn decode(bytes: Bytes, context: &CrystalContext) -> CrystalResult<Self>;

    /// Persist data held outside the snapshot, before it is encoded.
    async fn save_data(&self, _unload: bool) -> CrystalResult<()> {
        Ok(())
    }

    /// Re-apply journal records written after the loaded snapshot.
    async fn replay(&mut self, _records: &[JournalRecord], _plane: u32) -> CrystalResult<usize> {
        Ok(0)
    }
}

#[async_trait]
impl CrystalObject for DataTree {
    fn create(context: &CrystalContext) -> Self {
        DataTree::new(context.tree_context())
    }

    async fn encode(&self) -> CrystalResult<Bytes> {
        let snapshot = self.snapshot().await;
        let encoded = bincode::serialize(&snapshot).map_err(CrystalError::serialize)?;
        Ok(Bytes::from(encoded))
    }

    fn decode(bytes: Bytes, context: &CrystalContext) -> CrystalResult<Self> {
        let snapshot: TreeSnapshot =
            bincode::deserialize(&bytes).map_err(CrystalError::deserialize)?;
        Ok(DataTree::restore(context.tree_context(), snapshot))
    }

    async fn save_data(&self, unload: bool) -> CrystalResult<()> {
        self.save(unload).await
    }

    async fn replay(&mut self, records: &[JournalRecord], plane: u32) -> CrystalResult<usize> {
        let tree: &DataTree = self;
        tree.replay(records, plane).await
    }
}

/// A plain serde value stored whole in its snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document<T>(pub T);

impl<T> Deref for Document<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Document<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

#[async_trait]
impl<T> CrystalObject for Document<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    fn create(_context: &CrystalContext) -> Self {
        Document(T::default())
    }

    async fn encode(&self) -> CrystalResult<Bytes> {
        let encoded = bincode::serialize(&self.0).map_err(CrystalError::serialize)?;
        Ok(Bytes::from(encoded))
    }

    fn decode(bytes: Bytes, _context: &CrystalContext) -> CrystalResult<Self> {
        let value = bincode::deserialize(&bytes).map_err(CrystalError::deserialize)?;
        Ok(Document(value))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crystal_data::{BlockDatum, DatumRegistry};
    use crystal_filer::LocalFiler;
    use crystal_storage::{SimpleStorage, StorageGroup};
    use crystal_types::{FilerConfiguration, StorageGroupConfiguration};

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Settings {
        name: String,
        retries: u32,
    }

    fn context() -> CrystalContext {
        let mut datums = DatumRegistry::new();
        datums.register(1, || BlockDatum::new(1024));
        CrystalContext::new(
            Arc::new(datums),
            Arc::new(StorageGroup::new(&StorageGroupConfiguration::default())),
        )
    }

    #[tokio::test]
    async fn document_round_trip() {
        let ctx = context();
        let mut doc = Document::<Settings>::create(&ctx);
        doc.name = "primary".into();
        doc.retries = 4;
        let bytes = doc.encode().await.unwrap();
        let decoded = Document::<Settings>::decode(bytes, &ctx).unwrap();
        assert_eq!(decoded, doc);
    }

    #[tokio::test]
    async fn tree_round_trip_keeps_datum_locations() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context();
        ctx.storage
            .add_storage(
                FilerConfiguration::local(dir.path()),
                Arc::new(SimpleStorage::new(Arc::new(LocalFiler::new(dir.path())))),
            )
            .unwrap();

        let tree = DataTree::create(&ctx);
        let child = tree.root().add_child().await.unwrap();
        child
            .lock::<BlockDatum>()
            .await
            .unwrap()
            .set(Bytes::from_static(b"payload"))
            .unwrap();
        tree.save_data(true).await.unwrap();
        let bytes = tree.encode().await.unwrap();

        let restored = DataTree::decode(bytes, &ctx).unwrap();
        assert_eq!(restored.len(), 2);
        let node = restored.node(child.key()).unwrap();
        let mut block = node.lock::<BlockDatum>().await.unwrap();
        assert_eq!(&block.get().await.unwrap()[..], b"payload");
    }
}
