use std::any::type_name;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crystal_types::{CrystalError, CrystalResult, NodeId};

use crate::block::BlockDatum;
use crate::datum::Datum;
use crate::fragment::FragmentDatum;
use crate::object::ObjectDatum;
use crate::record::TreeRecord;
use crate::tree::{DatumSlot, NodeCell, NodeState, TreeShared};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handle to one node of a [`crate::DataTree`].
///
/// Handles are cheap to clone. A handle stays valid after its node is
/// deleted; operations on it then fail with `Deleted` (or report success for
/// `delete`).
#[derive(Clone, Debug)]
pub struct DataNode {
    tree: Arc<TreeShared>,
    key: NodeId,
    cell: NodeCell,
}

impl DataNode {
    pub(crate) fn new(tree: Arc<TreeShared>, key: NodeId, cell: NodeCell) -> Self {
        Self { tree, key, cell }
    }

    /// Handle whose node is already gone from the arena.
    pub(crate) fn detached(tree: Arc<TreeShared>, key: NodeId) -> Self {
        let cell = Arc::new(Mutex::new(NodeState {
            id: NodeId::DELETED,
            parent: None,
            children: Vec::new(),
            slots: Vec::new(),
        }));
        Self { tree, key, cell }
    }

    fn handle(&self, id: NodeId) -> Option<DataNode> {
        self.tree
            .get(id)
            .map(|cell| DataNode::new(self.tree.clone(), id, cell))
    }

    /// Id the node was created with, stable across deletion.
    pub fn key(&self) -> NodeId {
        self.key
    }

    /// Current id; `NodeId::DELETED` after deletion.
    pub async fn id(&self) -> NodeId {
        self.cell.lock().await.id
    }

    pub async fn is_deleted(&self) -> bool {
        self.cell.lock().await.is_deleted()
    }

    pub async fn parent(&self) -> Option<DataNode> {
        let parent = self.cell.lock().await.parent;
        parent.and_then(|id| self.handle(id))
    }

    pub async fn children(&self) -> CrystalResult<Vec<DataNode>> {
        let state = self.cell.lock().await;
        if state.is_deleted() {
            return Err(CrystalError::Deleted);
        }
        Ok(state
            .children
            .iter()
            .filter_map(|id| self.handle(*id))
            .collect())
    }

    /// Create a new child node.
    pub async fn add_child(&self) -> CrystalResult<DataNode> {
        let mut state = self.cell.lock().await;
        if state.is_deleted() {
            return Err(CrystalError::Deleted);
        }
        let id = self.tree.allocate_id();
        let cell = self.tree.insert(NodeState {
            id,
            parent: Some(self.key),
            children: Vec::new(),
            slots: Vec::new(),
        });
        state.children.push(id);
        self.tree.record(TreeRecord::Create {
            parent: self.key,
            child: id,
        });
        debug!(parent = %self.key, child = %id, "data node created");
        Ok(DataNode::new(self.tree.clone(), id, cell))
    }

    /// Lock the node and return a guard over its `D` slot, creating the
    /// slot if the node has none yet.
    pub async fn lock<D: Datum>(&self) -> CrystalResult<DatumGuard<D>> {
        let mut state = self.cell.clone().lock_owned().await;
        if state.is_deleted() {
            return Err(CrystalError::Deleted);
        }
        let type_id = self.tree.context.registry.type_id_of::<D>()?;
        let index = match state.slot_index(type_id) {
            Some(index) => index,
            None => {
                state.slots.push(DatumSlot {
                    type_id,
                    location: Default::default(),
                    datum: None,
                });
                state.slots.len() - 1
            }
        };
        if state.slots[index].datum.is_none() {
            state.slots[index].datum = Some(self.tree.context.registry.create(type_id)?);
        }
        Ok(DatumGuard {
            state,
            index,
            tree: self.tree.clone(),
            _datum: PhantomData,
        })
    }

    /// Save this node's subtree: children first, then every dirty slot.
    /// With `unload`, loaded datums are evicted afterwards.
    pub async fn save(&self, unload: bool) -> CrystalResult<()> {
        let mut state = self.cell.lock().await;
        save_locked(&self.tree, self.key, &mut state, unload).await
    }

    /// Delete this node, its subtree and every persisted payload beneath it.
    ///
    /// The parent is locked before the node itself. Deleting an already
    /// deleted node succeeds.
    pub async fn delete(&self) -> CrystalResult<bool> {
        let parent = {
            let state = self.cell.lock().await;
            if state.is_deleted() {
                return Ok(true);
            }
            state.parent
        };
        let parent_cell = parent.and_then(|id| self.tree.get(id));
        let mut parent_state = match &parent_cell {
            Some(cell) => Some(cell.lock().await),
            None => None,
        };

        let mut state = self.cell.lock().await;
        if state.is_deleted() {
            return Ok(true);
        }
        delete_locked(&self.tree, self.key, &mut state).await?;
        if let Some(parent_state) = parent_state.as_mut() {
            parent_state.children.retain(|c| *c != self.key);
        }
        self.tree.record(TreeRecord::Delete { node: self.key });
        debug!(node = %self.key, "data node deleted");
        Ok(true)
    }
}

fn save_locked<'a>(
    tree: &'a Arc<TreeShared>,
    key: NodeId,
    state: &'a mut NodeState,
    unload: bool,
) -> BoxFuture<'a, CrystalResult<()>> {
    Box::pin(async move {
        if state.is_deleted() {
            return Ok(());
        }
        for child in state.children.clone() {
            if let Some(cell) = tree.get(child) {
                let mut child_state = cell.lock().await;
                save_locked(tree, child, &mut child_state, unload).await?;
            }
        }
        for slot in state.slots.iter_mut() {
            flush_slot(tree, key, slot).await?;
            if unload {
                if let Some(datum) = slot.datum.as_mut() {
                    let before = datum.memory_size() as i64;
                    datum.unload();
                    tree.adjust_usage(datum.memory_size() as i64 - before);
                }
            }
        }
        Ok(())
    })
}

/// Write a dirty slot through the storage router and journal its location.
async fn flush_slot(tree: &TreeShared, key: NodeId, slot: &mut DatumSlot) -> CrystalResult<()> {
    let Some(datum) = slot.datum.as_mut() else {
        return Ok(());
    };
    if !datum.is_dirty() {
        return Ok(());
    }
    let bytes = datum.encode()?;
    tree.context.storage.put(&mut slot.location, bytes).await?;
    datum.mark_clean();
    tree.record(TreeRecord::Locator {
        node: key,
        type_id: slot.type_id,
        location: slot.location,
    });
    Ok(())
}

fn delete_locked<'a>(
    tree: &'a Arc<TreeShared>,
    key: NodeId,
    state: &'a mut NodeState,
) -> BoxFuture<'a, CrystalResult<()>> {
    Box::pin(async move {
        for child in std::mem::take(&mut state.children) {
            if let Some(cell) = tree.get(child) {
                let mut child_state = cell.lock().await;
                delete_locked(tree, child, &mut child_state).await?;
            }
        }
        for mut slot in state.slots.drain(..) {
            if let Some(datum) = slot.datum.take() {
                tree.adjust_usage(-(datum.memory_size() as i64));
            }
            if slot.location.is_persisted() {
                match tree.context.storage.delete(&mut slot.location).await {
                    Ok(()) | Err(CrystalError::NoFile) | Err(CrystalError::NotFound) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        state.id = NodeId::DELETED;
        state.parent = None;
        tree.remove(key);
        Ok(())
    })
}

/// Exclusive access to one datum slot of a locked node.
///
/// The node stays locked until the guard is dropped.
pub struct DatumGuard<D: Datum> {
    state: OwnedMutexGuard<NodeState>,
    index: usize,
    tree: Arc<TreeShared>,
    _datum: PhantomData<fn() -> D>,
}

impl<D: Datum> std::fmt::Debug for DatumGuard<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatumGuard")
            .field("node", &self.state.id)
            .field("slot", &self.state.slots[self.index])
            .finish()
    }
}

impl<D: Datum> DatumGuard<D> {
    pub fn node_id(&self) -> NodeId {
        self.state.id
    }

    /// Persisted location of the slot.
    pub fn location(&self) -> crystal_types::BlobLocation {
        self.state.slots[self.index].location
    }

    fn datum_ref(&self) -> CrystalResult<&D> {
        self.state.slots[self.index]
            .datum
            .as_ref()
            .and_then(|d| d.as_any().downcast_ref::<D>())
            .ok_or(CrystalError::DatumNotRegistered(type_name::<D>()))
    }

    fn datum_mut(&mut self) -> CrystalResult<&mut D> {
        self.state.slots[self.index]
            .datum
            .as_mut()
            .and_then(|d| d.as_any_mut().downcast_mut::<D>())
            .ok_or(CrystalError::DatumNotRegistered(type_name::<D>()))
    }

    pub fn is_dirty(&self) -> bool {
        self.datum_ref().map(|d| d.is_dirty()).unwrap_or(false)
    }

    /// Load the datum from storage if it is not in memory yet.
    pub async fn load(&mut self) -> CrystalResult<&mut D> {
        if self.datum_ref()?.is_loaded() {
            return self.datum_mut();
        }
        let location = self.location();
        if location.is_persisted() {
            let bytes = self.tree.context.storage.get(&location).await?;
            let tree = self.tree.clone();
            let datum = self.datum_mut()?;
            datum.restore(bytes)?;
            tree.adjust_usage(datum.memory_size() as i64);
        } else {
            self.datum_mut()?.restore_empty();
        }
        self.datum_mut()
    }

    /// Run a mutation and report its memory delta.
    fn mutate<R>(&mut self, f: impl FnOnce(&mut D) -> CrystalResult<R>) -> CrystalResult<R> {
        let tree = self.tree.clone();
        let datum = self.datum_mut()?;
        let before = datum.memory_size() as i64;
        let result = f(&mut *datum);
        tree.adjust_usage(datum.memory_size() as i64 - before);
        result
    }

    /// Save this slot now, without touching the rest of the node.
    pub async fn save(&mut self) -> CrystalResult<()> {
        let key = self.state.id;
        let tree = self.tree.clone();
        flush_slot(&tree, key, &mut self.state.slots[self.index]).await
    }
}

impl DatumGuard<BlockDatum> {
    pub async fn get(&mut self) -> CrystalResult<Bytes> {
        self.load().await?.get()
    }

    pub fn set(&mut self, data: Bytes) -> CrystalResult<()> {
        self.mutate(|block| block.set(data))
    }
}

impl DatumGuard<FragmentDatum> {
    pub async fn get(&mut self, id: u64) -> CrystalResult<Option<Bytes>> {
        Ok(self.load().await?.get(id))
    }

    pub async fn set(&mut self, id: u64, data: Bytes) -> CrystalResult<()> {
        self.load().await?;
        self.mutate(|fragments| fragments.set(id, data))
    }

    pub async fn remove(&mut self, id: u64) -> CrystalResult<bool> {
        self.load().await?;
        self.mutate(|fragments| Ok(fragments.remove(id)))
    }

    pub async fn len(&mut self) -> CrystalResult<usize> {
        Ok(self.load().await?.len())
    }

    pub async fn ids(&mut self) -> CrystalResult<Vec<u64>> {
        Ok(self.load().await?.ids())
    }
}

impl<T> DatumGuard<ObjectDatum<T>>
where
    T: Serialize + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static,
{
    pub async fn get(&mut self) -> CrystalResult<&T> {
        let datum: &ObjectDatum<T> = self.load().await?;
        datum.get()
    }

    pub fn set(&mut self, value: T) -> CrystalResult<()> {
        self.mutate(|object| object.set(value))
    }
}
