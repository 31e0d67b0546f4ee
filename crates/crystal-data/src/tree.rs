//! Arena holding every node of one data-node tree.
//!
//! Nodes refer to their parent and children by [`NodeId`] only. The arena
//! maps ids to per-node `tokio::sync::Mutex` cells; the map itself sits
//! behind a `std::sync::RwLock` that is never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crystal_journal::{Journal, JournalRecord};
use crystal_storage::StorageGroup;
use crystal_types::{BlobLocation, CrystalResult, NodeId};

use crate::datum::{Datum, DatumRegistry};
use crate::memory::MemoryUsage;
use crate::node::DataNode;
use crate::record::TreeRecord;

/// One typed payload slot of a node.
#[derive(Debug)]
pub struct DatumSlot {
    pub type_id: u16,
    pub location: BlobLocation,
    /// Datum instance, unloaded by a save with unload. `None` until the
    /// slot is first locked.
    pub datum: Option<Box<dyn Datum>>,
}

/// Mutable state of one node, guarded by the node's lock.
#[derive(Debug)]
pub struct NodeState {
    /// `NodeId::DELETED` once the node has been deleted.
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub slots: Vec<DatumSlot>,
}

impl NodeState {
    fn new(id: NodeId, parent: Option<NodeId>) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.id.is_deleted()
    }

    pub(crate) fn slot_index(&self, type_id: u16) -> Option<usize> {
        self.slots.iter().position(|s| s.type_id == type_id)
    }
}

/// Collaborators shared by every node of a tree.
#[derive(Clone, Debug)]
pub struct TreeContext {
    pub registry: Arc<DatumRegistry>,
    pub storage: Arc<StorageGroup>,
    pub usage: Arc<MemoryUsage>,
    /// Journal receiving tree mutations, and the plane token to tag them with.
    pub journal: Option<(Arc<Journal>, u32)>,
}

pub(crate) type NodeCell = Arc<Mutex<NodeState>>;

#[derive(Debug)]
pub(crate) struct TreeShared {
    pub(crate) context: TreeContext,
    nodes: RwLock<HashMap<NodeId, NodeCell>>,
    next_id: AtomicI64,
}

impl TreeShared {
    pub(crate) fn get(&self, id: NodeId) -> Option<NodeCell> {
        self.nodes
            .read()
            .expect("tree lock poisoned")
            .get(&id)
            .cloned()
    }

    pub(crate) fn insert(&self, state: NodeState) -> NodeCell {
        let id = state.id;
        let cell = Arc::new(Mutex::new(state));
        self.nodes
            .write()
            .expect("tree lock poisoned")
            .insert(id, cell.clone());
        cell
    }

    pub(crate) fn remove(&self, id: NodeId) {
        self.nodes.write().expect("tree lock poisoned").remove(&id);
    }

    pub(crate) fn allocate_id(&self) -> NodeId {
        NodeId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Ensure future ids are above `id`.
    fn observe_id(&self, id: NodeId) {
        self.next_id.fetch_max(id.get() + 1, Ordering::SeqCst);
    }

    /// Append a tree record to the attached journal, if any.
    pub(crate) fn record(&self, record: TreeRecord) {
        if let Some((journal, plane)) = &self.context.journal {
            if let Err(err) = record.append(journal, *plane) {
                warn!(?record, error = %err, "failed to journal tree mutation");
            }
        }
    }

    pub(crate) fn adjust_usage(&self, delta: i64) {
        self.context.usage.adjust(delta);
    }
}

/// Persisted location of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub type_id: u16,
    pub location: BlobLocation,
}

/// Persisted shape of one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub slots: Vec<SlotSnapshot>,
    pub children: Vec<NodeId>,
}

/// Persisted shape of a whole tree, root first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub next_id: i64,
    pub nodes: Vec<NodeSnapshot>,
}

/// A tree of data nodes rooted at [`NodeId::ROOT`].
#[derive(Clone, Debug)]
pub struct DataTree {
    shared: Arc<TreeShared>,
}

impl DataTree {
    /// Empty tree holding only the root node.
    pub fn new(context: TreeContext) -> Self {
        let shared = Arc::new(TreeShared {
            context,
            nodes: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(NodeId::ROOT.get() + 1),
        });
        shared.insert(NodeState::new(NodeId::ROOT, None));
        Self { shared }
    }

    /// Rebuild a tree from a snapshot. Datums are loaded lazily.
    pub fn restore(context: TreeContext, snapshot: TreeSnapshot) -> Self {
        if !snapshot.nodes.iter().any(|n| n.id == NodeId::ROOT) {
            return Self::new(context);
        }
        let shared = Arc::new(TreeShared {
            context,
            nodes: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(snapshot.next_id.max(NodeId::ROOT.get() + 1)),
        });
        let count = snapshot.nodes.len();
        for node in snapshot.nodes {
            shared.observe_id(node.id);
            shared.insert(NodeState {
                id: node.id,
                parent: node.parent,
                children: node.children,
                slots: node
                    .slots
                    .into_iter()
                    .map(|s| DatumSlot {
                        type_id: s.type_id,
                        location: s.location,
                        datum: None,
                    })
                    .collect(),
            });
        }
        debug!(nodes = count, "data tree restored");
        Self { shared }
    }

    pub fn root(&self) -> DataNode {
        self.node(NodeId::ROOT)
            .unwrap_or_else(|| DataNode::detached(self.shared.clone(), NodeId::ROOT))
    }

    /// Handle for a live node.
    pub fn node(&self, id: NodeId) -> Option<DataNode> {
        self.shared
            .get(id)
            .map(|cell| DataNode::new(self.shared.clone(), id, cell))
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.shared.nodes.read().expect("tree lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn context(&self) -> &TreeContext {
        &self.shared.context
    }

    pub fn memory_usage(&self) -> i64 {
        self.shared.context.usage.current()
    }

    /// Save every node, children first.
    pub async fn save(&self, unload: bool) -> CrystalResult<()> {
        self.root().save(unload).await
    }

    /// Capture node ids, parent links and persisted slot locations.
    ///
    /// Unsaved datum changes are not captured; save first.
    pub async fn snapshot(&self) -> TreeSnapshot {
        let mut nodes = Vec::new();
        let mut queue = VecDeque::from([NodeId::ROOT]);
        while let Some(id) = queue.pop_front() {
            let Some(cell) = self.shared.get(id) else {
                continue;
            };
            let state = cell.lock().await;
            if state.is_deleted() {
                continue;
            }
            queue.extend(state.children.iter().copied());
            nodes.push(NodeSnapshot {
                id,
                parent: state.parent,
                slots: state
                    .slots
                    .iter()
                    .filter(|s| s.location.is_persisted())
                    .map(|s| SlotSnapshot {
                        type_id: s.type_id,
                        location: s.location,
                    })
                    .collect(),
                children: state.children.clone(),
            });
        }
        TreeSnapshot {
            next_id: self.shared.next_id.load(Ordering::SeqCst),
            nodes,
        }
    }

    /// Re-apply journaled mutations tagged with `plane`. Returns the number
    /// of records applied.
    pub async fn replay(&self, records: &[JournalRecord], plane: u32) -> CrystalResult<usize> {
        let mut applied = 0;
        for record in records.iter().filter(|r| r.token == plane) {
            let Some(mutation) = TreeRecord::parse(record) else {
                continue;
            };
            if self.apply(mutation).await {
                applied += 1;
            }
        }
        if applied > 0 {
            info!(applied, plane, "replayed tree mutations");
        }
        Ok(applied)
    }

    async fn apply(&self, mutation: TreeRecord) -> bool {
        match mutation {
            TreeRecord::Create { parent, child } => {
                let Some(parent_cell) = self.shared.get(parent) else {
                    return false;
                };
                if self.shared.get(child).is_some() {
                    return false;
                }
                let mut parent_state = parent_cell.lock().await;
                if parent_state.is_deleted() {
                    return false;
                }
                self.shared.observe_id(child);
                self.shared.insert(NodeState::new(child, Some(parent)));
                parent_state.children.push(child);
                true
            }
            TreeRecord::Locator {
                node,
                type_id,
                location,
            } => {
                let Some(cell) = self.shared.get(node) else {
                    return false;
                };
                let mut state = cell.lock().await;
                if state.is_deleted() {
                    return false;
                }
                match state.slot_index(type_id) {
                    Some(index) => {
                        let slot = &mut state.slots[index];
                        if let Some(datum) = slot.datum.take() {
                            self.shared.adjust_usage(-(datum.memory_size() as i64));
                        }
                        slot.location = location;
                    }
                    None => state.slots.push(DatumSlot {
                        type_id,
                        location,
                        datum: None,
                    }),
                }
                true
            }
            TreeRecord::Delete { node } => {
                let Some(cell) = self.shared.get(node) else {
                    return false;
                };
                let parent = cell.lock().await.parent;
                if let Some(parent_cell) = parent.and_then(|p| self.shared.get(p)) {
                    parent_cell.lock().await.children.retain(|c| *c != node);
                }
                self.forget_subtree(node).await;
                true
            }
        }
    }

    /// Drop a subtree from the arena without touching storage.
    async fn forget_subtree(&self, id: NodeId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(cell) = self.shared.get(id) else {
                continue;
            };
            let mut state = cell.lock().await;
            pending.append(&mut state.children);
            for slot in state.slots.drain(..) {
                if let Some(datum) = slot.datum {
                    self.shared.adjust_usage(-(datum.memory_size() as i64));
                }
            }
            state.id = NodeId::DELETED;
            state.parent = None;
            self.shared.remove(id);
        }
    }
}
