use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crystal_types::{CrystalError, CrystalResult};

/// A typed payload living in one slot of a data node.
///
/// A datum starts unloaded. The owning guard either restores it from its
/// persisted bytes or, when nothing was ever written, marks it empty.
/// Mutations set the dirty flag; a save encodes dirty datums and clears it.
pub trait Datum: Any + Send + Sync + fmt::Debug {
    fn is_dirty(&self) -> bool;

    fn is_loaded(&self) -> bool;

    /// Approximate bytes held in memory.
    fn memory_size(&self) -> usize;

    /// Load state from persisted bytes.
    fn restore(&mut self, bytes: Bytes) -> CrystalResult<()>;

    /// Mark as loaded with no persisted state.
    fn restore_empty(&mut self);

    /// Serialize the current state for storage.
    fn encode(&self) -> CrystalResult<Bytes>;

    fn mark_clean(&mut self);

    /// Drop the in-memory state, returning to the unloaded state.
    fn unload(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

type DatumFactory = Arc<dyn Fn() -> Box<dyn Datum> + Send + Sync>;

struct RegisteredDatum {
    name: &'static str,
    factory: DatumFactory,
}

/// Maps datum types to stable numeric type ids and constructors.
///
/// Type ids are persisted with every slot, so they must never change for a
/// given datum type once data has been written.
#[derive(Default)]
pub struct DatumRegistry {
    by_type: HashMap<TypeId, u16>,
    by_id: HashMap<u16, RegisteredDatum>,
}

impl fmt::Debug for DatumRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<(u16, &str)> = self.by_id.iter().map(|(id, d)| (*id, d.name)).collect();
        ids.sort();
        f.debug_struct("DatumRegistry").field("types", &ids).finish()
    }
}

impl DatumRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register datum type `D` under `type_id`.
    ///
    /// # Panics
    ///
    /// Panics if `type_id` or `D` is already registered.
    pub fn register<D, F>(&mut self, type_id: u16, factory: F) -> &mut Self
    where
        D: Datum,
        F: Fn() -> D + Send + Sync + 'static,
    {
        let name = type_name::<D>();
        assert!(
            !self.by_id.contains_key(&type_id),
            "datum type id {type_id} registered twice"
        );
        assert!(
            self.by_type.insert(TypeId::of::<D>(), type_id).is_none(),
            "datum type {name} registered twice"
        );
        self.by_id.insert(
            type_id,
            RegisteredDatum {
                name,
                factory: Arc::new(move || Box::new(factory()) as Box<dyn Datum>),
            },
        );
        self
    }

    /// Type id of `D`.
    pub fn type_id_of<D: Datum>(&self) -> CrystalResult<u16> {
        self.by_type
            .get(&TypeId::of::<D>())
            .copied()
            .ok_or(CrystalError::DatumNotRegistered(type_name::<D>()))
    }

    /// Fresh, unloaded datum for `type_id`.
    pub fn create(&self, type_id: u16) -> CrystalResult<Box<dyn Datum>> {
        self.by_id
            .get(&type_id)
            .map(|d| (d.factory)())
            .ok_or(CrystalError::DatumNotRegistered("unknown datum type id"))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockDatum;
    use crate::fragment::FragmentDatum;

    #[test]
    fn lookup_by_type_and_id() {
        let mut registry = DatumRegistry::new();
        registry
            .register(1, || BlockDatum::new(64))
            .register(2, || FragmentDatum::new(4, 16));
        assert_eq!(registry.type_id_of::<BlockDatum>().unwrap(), 1);
        assert_eq!(registry.type_id_of::<FragmentDatum>().unwrap(), 2);
        let datum = registry.create(1).unwrap();
        assert!(datum.as_any().is::<BlockDatum>());
        assert!(!datum.is_loaded());
    }

    #[test]
    fn unregistered_type() {
        let registry = DatumRegistry::new();
        assert!(matches!(
            registry.type_id_of::<BlockDatum>(),
            Err(CrystalError::DatumNotRegistered(_))
        ));
        assert!(registry.create(9).is_err());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_type_id_panics() {
        let mut registry = DatumRegistry::new();
        registry.register(1, || BlockDatum::new(64));
        registry.register(1, || FragmentDatum::new(1, 1));
    }
}
