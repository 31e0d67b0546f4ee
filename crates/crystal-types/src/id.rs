use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a storage backend registered with a storage router.
///
/// Zero means "no storage"; registered backends always carry a random
/// nonzero id.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageId(u16);

impl StorageId {
    /// The "not yet persisted" storage id.
    pub const NONE: Self = Self(0);

    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    /// Returns `true` for the zero id.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageId({:04x})", self.0)
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Identifier of a blob inside one storage backend.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(u64);

impl FileId {
    /// The "not yet persisted" file id.
    pub const NONE: Self = Self(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({:x})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// Persisted location of a datum payload: which backend, which blob.
///
/// Either half being zero means the payload was never written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobLocation {
    pub storage: StorageId,
    pub file: FileId,
}

impl BlobLocation {
    /// A location that has not been persisted.
    pub const NONE: Self = Self {
        storage: StorageId::NONE,
        file: FileId::NONE,
    };

    pub const fn new(storage: StorageId, file: FileId) -> Self {
        Self { storage, file }
    }

    /// Returns `true` if both ids are set.
    pub const fn is_persisted(&self) -> bool {
        !self.storage.is_none() && !self.file.is_none()
    }

    /// Reset both ids to zero.
    pub fn clear(&mut self) {
        *self = Self::NONE;
    }
}

/// Identifier of a node in a data-node tree.
///
/// `-1` marks a deleted (tombstoned) node and is never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(i64);

impl NodeId {
    /// Id carried by a tombstoned node.
    pub const DELETED: Self = Self(-1);

    /// Id of the root node of every tree.
    pub const ROOT: Self = Self(0);

    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn is_deleted(self) -> bool {
        self.0 == -1
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ids_are_none() {
        assert!(StorageId::NONE.is_none());
        assert!(FileId::default().is_none());
        assert!(!BlobLocation::NONE.is_persisted());
    }

    #[test]
    fn half_set_location_is_not_persisted() {
        let loc = BlobLocation::new(StorageId::new(7), FileId::NONE);
        assert!(!loc.is_persisted());
        let loc = BlobLocation::new(StorageId::NONE, FileId::new(9));
        assert!(!loc.is_persisted());
    }

    #[test]
    fn clear_resets_both_halves() {
        let mut loc = BlobLocation::new(StorageId::new(1), FileId::new(2));
        assert!(loc.is_persisted());
        loc.clear();
        assert_eq!(loc, BlobLocation::NONE);
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(StorageId::new(0xab).to_string(), "00ab");
        assert_eq!(FileId::new(0x1f).to_string(), "000000000000001f");
    }

    #[test]
    fn deleted_node_id() {
        assert!(NodeId::DELETED.is_deleted());
        assert!(!NodeId::ROOT.is_deleted());
    }

    proptest::proptest! {
        #[test]
        fn persisted_iff_both_halves_set(storage in proptest::num::u16::ANY, file in proptest::num::u64::ANY) {
            let loc = BlobLocation::new(StorageId::new(storage), FileId::new(file));
            proptest::prop_assert_eq!(loc.is_persisted(), storage != 0 && file != 0);
        }
    }
}
