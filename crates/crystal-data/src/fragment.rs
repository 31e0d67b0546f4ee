//! Keyed multi-fragment datum.
//!
//! Encoding, repeated per fragment in ascending id order:
//! ```text
//! [8 bytes: fragment id (little-endian u64)]
//! [4 bytes: length (little-endian u32)]
//! [N bytes: fragment bytes]
//! ```

use std::any::Any;
use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crystal_types::{CrystalError, CrystalResult};

use crate::datum::Datum;

const FRAGMENT_HEADER: usize = 12;

/// Ordered set of `(id, bytes)` fragments, bounded in count and size.
///
/// Always saved as a whole rewrite of every fragment.
#[derive(Debug)]
pub struct FragmentDatum {
    max_count: usize,
    max_size: usize,
    fragments: BTreeMap<u64, Bytes>,
    loaded: bool,
    dirty: bool,
}

impl FragmentDatum {
    pub fn new(max_count: usize, max_size: usize) -> Self {
        Self {
            max_count,
            max_size,
            fragments: BTreeMap::new(),
            loaded: false,
            dirty: false,
        }
    }

    pub fn get(&self, id: u64) -> Option<Bytes> {
        self.fragments.get(&id).cloned()
    }

    /// Insert or replace fragment `id`.
    pub fn set(&mut self, id: u64, data: Bytes) -> CrystalResult<()> {
        if data.len() > self.max_size {
            return Err(CrystalError::OverSizeLimit {
                size: data.len(),
                limit: self.max_size,
            });
        }
        if !self.fragments.contains_key(&id) && self.fragments.len() >= self.max_count {
            return Err(CrystalError::OverNumberLimit {
                count: self.fragments.len() + 1,
                limit: self.max_count,
            });
        }
        self.fragments.insert(id, data);
        self.loaded = true;
        self.dirty = true;
        Ok(())
    }

    /// Remove fragment `id`. Returns whether it existed.
    pub fn remove(&mut self, id: u64) -> bool {
        let removed = self.fragments.remove(&id).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Fragment ids in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        self.fragments.keys().copied().collect()
    }
}

impl Datum for FragmentDatum {
    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn memory_size(&self) -> usize {
        self.fragments
            .values()
            .map(|f| f.len() + FRAGMENT_HEADER)
            .sum()
    }

    fn restore(&mut self, mut bytes: Bytes) -> CrystalResult<()> {
        let mut fragments = BTreeMap::new();
        while bytes.has_remaining() {
            if bytes.remaining() < FRAGMENT_HEADER {
                return Err(CrystalError::deserialize("truncated fragment header"));
            }
            let id = bytes.get_u64_le();
            let len = bytes.get_u32_le() as usize;
            if bytes.remaining() < len {
                return Err(CrystalError::deserialize(format!(
                    "fragment {id} claims {len} bytes, {} remain",
                    bytes.remaining()
                )));
            }
            fragments.insert(id, bytes.split_to(len));
        }
        self.fragments = fragments;
        self.loaded = true;
        self.dirty = false;
        Ok(())
    }

    fn restore_empty(&mut self) {
        self.fragments.clear();
        self.loaded = true;
        self.dirty = false;
    }

    fn encode(&self) -> CrystalResult<Bytes> {
        let mut out = BytesMut::with_capacity(self.memory_size());
        for (id, data) in &self.fragments {
            out.put_u64_le(*id);
            out.put_u32_le(data.len() as u32);
            out.put_slice(data);
        }
        Ok(out.freeze())
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn unload(&mut self) {
        self.fragments.clear();
        self.loaded = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_bound_rejects_new_id_only() {
        let mut fragments = FragmentDatum::new(2, 8);
        fragments.set(1, Bytes::from_static(b"a")).unwrap();
        fragments.set(2, Bytes::from_static(b"b")).unwrap();
        let err = fragments.set(3, Bytes::from_static(b"c")).unwrap_err();
        assert_eq!(err, CrystalError::OverNumberLimit { count: 3, limit: 2 });
        assert_eq!(fragments.len(), 2);
        // Replacing an existing id is still allowed.
        fragments.set(2, Bytes::from_static(b"bb")).unwrap();
        assert_eq!(&fragments.get(2).unwrap()[..], b"bb");
    }

    #[test]
    fn size_bound() {
        let mut fragments = FragmentDatum::new(2, 2);
        assert!(matches!(
            fragments.set(1, Bytes::from_static(b"abc")),
            Err(CrystalError::OverSizeLimit { size: 3, limit: 2 })
        ));
        assert!(fragments.is_empty());
    }

    #[test]
    fn encoding_layout() {
        let mut fragments = FragmentDatum::new(4, 8);
        fragments.set(7, Bytes::from_static(b"xy")).unwrap();
        let encoded = fragments.encode().unwrap();
        assert_eq!(
            &encoded[..],
            &[7, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, b'x', b'y']
        );

        let mut restored = FragmentDatum::new(4, 8);
        restored.restore(encoded).unwrap();
        assert_eq!(restored.ids(), vec![7]);
        assert!(!restored.is_dirty());
    }

    #[test]
    fn truncated_encoding_is_rejected() {
        let mut fragments = FragmentDatum::new(4, 8);
        let err = fragments
            .restore(Bytes::from_static(&[1, 0, 0, 0, 0, 0, 0, 0, 9, 0, 0, 0, 1]))
            .unwrap_err();
        assert!(matches!(err, CrystalError::DeserializeError(_)));
    }

    #[test]
    fn remove_marks_dirty() {
        let mut fragments = FragmentDatum::new(4, 8);
        fragments.restore_empty();
        assert!(!fragments.remove(1));
        assert!(!fragments.is_dirty());
        fragments.set(1, Bytes::from_static(b"z")).unwrap();
        fragments.mark_clean();
        assert!(fragments.remove(1));
        assert!(fragments.is_dirty());
    }

    proptest::proptest! {
        #[test]
        fn count_never_exceeds_bound(ids in proptest::collection::vec(0u64..16, 0..64), max in 1usize..8) {
            let mut fragments = FragmentDatum::new(max, 4);
            for id in ids {
                let before = fragments.len();
                match fragments.set(id, Bytes::from_static(b"v")) {
                    Ok(()) => {
                        proptest::prop_assert!(fragments.len() <= max);
                    }
                    Err(CrystalError::OverNumberLimit { count, limit }) => {
                        proptest::prop_assert_eq!(count, before + 1);
                        proptest::prop_assert_eq!(limit, max);
                        proptest::prop_assert_eq!(fragments.len(), before);
                    }
                    Err(other) => {
                        proptest::prop_assert!(false, "unexpected error {}", other);
                    }
                }
            }
        }
    }
}
