use std::any::Any;

use bytes::Bytes;

use crystal_types::{CrystalError, CrystalResult};

use crate::datum::Datum;

/// One contiguous byte buffer, replaced as a whole.
#[derive(Debug)]
pub struct BlockDatum {
    max_data_size: usize,
    data: Option<Bytes>,
    loaded: bool,
    dirty: bool,
}

impl BlockDatum {
    pub fn new(max_data_size: usize) -> Self {
        Self {
            max_data_size,
            data: None,
            loaded: false,
            dirty: false,
        }
    }

    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    /// Current value; `NoData` if nothing was ever written.
    pub fn get(&self) -> CrystalResult<Bytes> {
        self.data.clone().ok_or(CrystalError::NoData)
    }

    /// Replace the value.
    pub fn set(&mut self, data: Bytes) -> CrystalResult<()> {
        if data.len() > self.max_data_size {
            return Err(CrystalError::OverSizeLimit {
                size: data.len(),
                limit: self.max_data_size,
            });
        }
        self.data = Some(data);
        self.loaded = true;
        self.dirty = true;
        Ok(())
    }
}

impl Datum for BlockDatum {
    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn memory_size(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len)
    }

    fn restore(&mut self, bytes: Bytes) -> CrystalResult<()> {
        self.data = Some(bytes);
        self.loaded = true;
        self.dirty = false;
        Ok(())
    }

    fn restore_empty(&mut self) {
        self.data = None;
        self.loaded = true;
        self.dirty = false;
    }

    fn encode(&self) -> CrystalResult<Bytes> {
        self.get()
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn unload(&mut self) {
        self.data = None;
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
    fn set_respects_max_size() {
        let mut block = BlockDatum::new(4);
        block.set(Bytes::from_static(b"1234")).unwrap();
        let err = block.set(Bytes::from_static(b"12345")).unwrap_err();
        assert_eq!(err, CrystalError::OverSizeLimit { size: 5, limit: 4 });
        assert_eq!(&block.get().unwrap()[..], b"1234");
        assert!(block.is_dirty());
    }

    #[test]
    fn empty_block_has_no_data() {
        let mut block = BlockDatum::new(4);
        block.restore_empty();
        assert!(block.is_loaded());
        assert_eq!(block.get().unwrap_err(), CrystalError::NoData);
    }

    #[test]
    fn unload_drops_bytes() {
        let mut block = BlockDatum::new(8);
        block.restore(Bytes::from_static(b"abc")).unwrap();
        assert_eq!(block.memory_size(), 3);
        block.unload();
        assert!(!block.is_loaded());
        assert_eq!(block.memory_size(), 0);
    }
}
