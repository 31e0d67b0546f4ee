//! Journal records describing tree mutations.
//!
//! Payloads, all little-endian:
//! ```text
//! Create:  [parent id i64] [child id i64]
//! Locator: [node id i64] [datum type id u16] [storage id u16] [file id u64]
//! Delete:  [node id i64]
//! ```

use bytes::Buf;

use crystal_journal::{Journal, JournalRecord, JournalRecordType};
use crystal_types::{BlobLocation, CrystalResult, FileId, NodeId, StorageId};

/// A tree mutation as recorded in the journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeRecord {
    Create { parent: NodeId, child: NodeId },
    Locator { node: NodeId, type_id: u16, location: BlobLocation },
    Delete { node: NodeId },
}

impl TreeRecord {
    /// Append this record to `journal` under `plane`. Returns the end position.
    pub fn append(&self, journal: &Journal, plane: u32) -> CrystalResult<u64> {
        let writer = match self {
            Self::Create { parent, child } => {
                let mut w = journal.get_writer(JournalRecordType::Create, plane);
                w.put_i64_le(parent.get()).put_i64_le(child.get());
                w
            }
            Self::Locator {
                node,
                type_id,
                location,
            } => {
                let mut w = journal.get_writer(JournalRecordType::Locator, plane);
                w.put_i64_le(node.get())
                    .put_u16_le(*type_id)
                    .put_u16_le(location.storage.get())
                    .put_u64_le(location.file.get());
                w
            }
            Self::Delete { node } => {
                let mut w = journal.get_writer(JournalRecordType::Delete, plane);
                w.put_i64_le(node.get());
                w
            }
        };
        journal.add(writer)
    }

    /// Decode a journal record. Records of other types, or with malformed
    /// payloads, yield `None`.
    pub fn parse(record: &JournalRecord) -> Option<Self> {
        let mut payload = record.payload.clone();
        match record.record_type {
            JournalRecordType::Create if payload.len() == 16 => Some(Self::Create {
                parent: NodeId::new(payload.get_i64_le()),
                child: NodeId::new(payload.get_i64_le()),
            }),
            JournalRecordType::Locator if payload.len() == 20 => {
                let node = NodeId::new(payload.get_i64_le());
                let type_id = payload.get_u16_le();
                let storage = StorageId::new(payload.get_u16_le());
                let file = FileId::new(payload.get_u64_le());
                Some(Self::Locator {
                    node,
                    type_id,
                    location: BlobLocation::new(storage, file),
                })
            }
            JournalRecordType::Delete if payload.len() == 8 => Some(Self::Delete {
                node: NodeId::new(payload.get_i64_le()),
            }),
            _ => None,
        }
    }
}
