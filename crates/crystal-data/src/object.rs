use std::any::Any;
use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crystal_types::{CrystalError, CrystalResult};

use crate::datum::Datum;

/// A single typed value stored as bincode.
pub struct ObjectDatum<T> {
    value: Option<T>,
    /// Encoded size of `value`, used for memory accounting.
    footprint: usize,
    loaded: bool,
    dirty: bool,
}

impl<T> Default for ObjectDatum<T> {
    fn default() -> Self {
        Self {
            value: None,
            footprint: 0,
            loaded: false,
            dirty: false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ObjectDatum<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDatum")
            .field("value", &self.value)
            .field("loaded", &self.loaded)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl<T> ObjectDatum<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value; `NoData` if nothing was ever written.
    pub fn get(&self) -> CrystalResult<&T> {
        self.value.as_ref().ok_or(CrystalError::NoData)
    }

    pub fn set(&mut self, value: T) -> CrystalResult<()> {
        self.footprint = bincode::serialized_size(&value).map_err(CrystalError::serialize)? as usize;
        self.value = Some(value);
        self.loaded = true;
        self.dirty = true;
        Ok(())
    }
}

impl<T> Datum for ObjectDatum<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static,
{
    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn memory_size(&self) -> usize {
        self.footprint
    }

    fn restore(&mut self, bytes: Bytes) -> CrystalResult<()> {
        let value = bincode::deserialize(&bytes).map_err(CrystalError::deserialize)?;
        self.value = Some(value);
        self.footprint = bytes.len();
        self.loaded = true;
        self.dirty = false;
        Ok(())
    }

    fn restore_empty(&mut self) {
        self.value = None;
        self.footprint = 0;
        self.loaded = true;
        self.dirty = false;
    }

    fn encode(&self) -> CrystalResult<Bytes> {
        let value = self.get()?;
        let encoded = bincode::serialize(value).map_err(CrystalError::serialize)?;
        Ok(Bytes::from(encoded))
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn unload(&mut self) {
        self.value = None;
        self.footprint = 0;
        self.loaded = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
