use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crystal_types::{
    BlobLocation, CrystalError, CrystalResult, FileId, FilerConfiguration, StorageGroupConfiguration,
    StorageId,
};

use crate::backend::StorageBackend;

/// `used / capacity` clamped to `[0, 1]`; zero when capacity is zero.
pub fn usage_ratio(used: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    (used as f64 / capacity as f64).clamp(0.0, 1.0)
}

/// One backend registered with a [`StorageGroup`].
#[derive(Clone, Debug)]
pub struct StorageRecord {
    pub id: StorageId,
    pub configuration: FilerConfiguration,
    pub capacity: u64,
    pub backend: Arc<dyn StorageBackend>,
}

impl StorageRecord {
    pub fn usage_ratio(&self) -> f64 {
        usage_ratio(self.backend.used_bytes(), self.capacity)
    }
}

/// Persisted form of a [`StorageRecord`], without the live backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "MapRecord", from = "MapRecord")]
pub struct StorageMapEntry {
    pub id: StorageId,
    pub configuration: FilerConfiguration,
    pub capacity: u64,
}

/// Wire form of a storage map entry. Filer configurations are internally
/// tagged for TOML, which bincode cannot decode, so the map carries its own
/// externally tagged copy.
#[derive(Serialize, Deserialize)]
struct MapRecord {
    id: StorageId,
    location: MapLocation,
    capacity: u64,
}

#[derive(Serialize, Deserialize)]
enum MapLocation {
    Empty,
    Local {
        path: std::path::PathBuf,
        capacity: Option<u64>,
    },
    Bucket {
        bucket: String,
        path: String,
        capacity: Option<u64>,
    },
}

impl From<StorageMapEntry> for MapRecord {
    fn from(entry: StorageMapEntry) -> Self {
        let location = match entry.configuration {
            FilerConfiguration::Empty => MapLocation::Empty,
            FilerConfiguration::LocalDirectory { path, capacity } => {
                MapLocation::Local { path, capacity }
            }
            FilerConfiguration::RemoteBucket {
                bucket,
                path,
                capacity,
            } => MapLocation::Bucket {
                bucket,
                path,
                capacity,
            },
        };
        Self {
            id: entry.id,
            location,
            capacity: entry.capacity,
        }
    }
}

impl From<MapRecord> for StorageMapEntry {
    fn from(record: MapRecord) -> Self {
        let configuration = match record.location {
            MapLocation::Empty => FilerConfiguration::Empty,
            MapLocation::Local { path, capacity } => {
                FilerConfiguration::LocalDirectory { path, capacity }
            }
            MapLocation::Bucket {
                bucket,
                path,
                capacity,
            } => FilerConfiguration::RemoteBucket {
                bucket,
                path,
                capacity,
            },
        };
        Self {
            id: record.id,
            configuration,
            capacity: record.capacity,
        }
    }
}

/// Usage report for one backend.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StorageUsage {
    pub id: StorageId,
    pub used: u64,
    pub capacity: u64,
    pub ratio: f64,
}

#[derive(Debug, Default)]
struct GroupState {
    records: Vec<StorageRecord>,
    current: Option<StorageId>,
    rotation_count: u64,
}

impl GroupState {
    fn find(&self, id: StorageId) -> Option<&StorageRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn fresh_id(&self) -> StorageId {
        let mut rng = rand::thread_rng();
        loop {
            let id = StorageId::new(rng.gen());
            if !id.is_none() && self.find(id).is_none() {
                return id;
            }
        }
    }

    fn check_unique(&self, configuration: &FilerConfiguration) -> CrystalResult<()> {
        let key = configuration.location_key();
        if self
            .records
            .iter()
            .any(|r| r.configuration.location_key() == key)
        {
            return Err(CrystalError::DuplicatePath(key));
        }
        Ok(())
    }

    /// Rotation policy for a new blob of `size` bytes.
    fn select(&mut self, size: u64, threshold: u64) -> CrystalResult<StorageRecord> {
        if self.records.is_empty() {
            return Err(CrystalError::NoStorage);
        }
        self.rotation_count = self.rotation_count.saturating_add(size);
        let current = self.current.and_then(|id| self.find(id)).cloned();
        if let Some(record) = current {
            if self.rotation_count <= threshold {
                return Ok(record);
            }
        }

        let mut best = &self.records[0];
        let mut best_ratio = best.usage_ratio();
        for record in &self.records[1..] {
            let ratio = record.usage_ratio();
            if ratio < best_ratio {
                best = record;
                best_ratio = ratio;
            }
        }
        let chosen = best.clone();
        debug!(storage = %chosen.id, ratio = best_ratio, "rotated write target");
        self.current = Some(chosen.id);
        self.rotation_count = size;
        Ok(chosen)
    }
}

/// Capacity-aware router over several storage backends.
///
/// The record index sits behind one `std::sync::Mutex` that is never held
/// across an await: operations clone the backend handle and release the
/// lock before any I/O.
#[derive(Debug)]
pub struct StorageGroup {
    rotation_threshold: u64,
    state: Mutex<GroupState>,
}

impl StorageGroup {
    pub fn new(config: &StorageGroupConfiguration) -> Self {
        Self {
            rotation_threshold: config.rotation_threshold,
            state: Mutex::new(GroupState::default()),
        }
    }

    /// Register a backend under a fresh random id.
    ///
    /// The capacity is taken from the configuration. A configuration whose
    /// location is already registered fails with `DuplicatePath`.
    pub fn add_storage(
        &self,
        configuration: FilerConfiguration,
        backend: Arc<dyn StorageBackend>,
    ) -> CrystalResult<StorageId> {
        let mut state = self.state.lock().expect("storage group lock poisoned");
        state.check_unique(&configuration)?;
        let id = state.fresh_id();
        let capacity = configuration.capacity();
        info!(storage = %id, location = %configuration.location_key(), capacity, "storage added");
        state.records.push(StorageRecord {
            id,
            configuration,
            capacity,
            backend,
        });
        Ok(id)
    }

    /// Re-register a backend under the id it had before a restart.
    pub fn restore_record(
        &self,
        entry: StorageMapEntry,
        backend: Arc<dyn StorageBackend>,
    ) -> CrystalResult<()> {
        let mut state = self.state.lock().expect("storage group lock poisoned");
        if entry.id.is_none() || state.find(entry.id).is_some() {
            return Err(CrystalError::DuplicatePath(format!(
                "storage id {} already in use",
                entry.id
            )));
        }
        state.check_unique(&entry.configuration)?;
        debug!(storage = %entry.id, location = %entry.configuration.location_key(), "storage restored");
        state.records.push(StorageRecord {
            id: entry.id,
            configuration: entry.configuration,
            capacity: entry.capacity,
            backend,
        });
        Ok(())
    }

    /// Id of the backend registered for the same location, if any.
    pub fn find_by_location(&self, configuration: &FilerConfiguration) -> Option<StorageId> {
        let key = configuration.location_key();
        let state = self.state.lock().expect("storage group lock poisoned");
        state
            .records
            .iter()
            .find(|r| r.configuration.location_key() == key)
            .map(|r| r.id)
    }

    /// Backend registered under `id`.
    pub fn backend(&self, id: StorageId) -> CrystalResult<Arc<dyn StorageBackend>> {
        if id.is_none() {
            return Err(CrystalError::NotFound);
        }
        let state = self.state.lock().expect("storage group lock poisoned");
        state
            .find(id)
            .map(|r| r.backend.clone())
            .ok_or(CrystalError::NotFound)
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("storage group lock poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the registered records in insertion order.
    pub fn records(&self) -> Vec<StorageRecord> {
        self.state
            .lock()
            .expect("storage group lock poisoned")
            .records
            .clone()
    }

    /// Persistable list of `(id, configuration, capacity)`.
    pub fn storage_map(&self) -> Vec<StorageMapEntry> {
        self.records()
            .into_iter()
            .map(|r| StorageMapEntry {
                id: r.id,
                configuration: r.configuration,
                capacity: r.capacity,
            })
            .collect()
    }

    /// Per-backend usage in insertion order.
    pub fn usage(&self) -> Vec<StorageUsage> {
        self.records()
            .into_iter()
            .map(|r| {
                let used = r.backend.used_bytes();
                StorageUsage {
                    id: r.id,
                    used,
                    capacity: r.capacity,
                    ratio: usage_ratio(used, r.capacity),
                }
            })
            .collect()
    }

    /// Resolve the write target for `location`.
    fn route(
        &self,
        location: &BlobLocation,
        size: u64,
    ) -> CrystalResult<(StorageId, FileId, Arc<dyn StorageBackend>)> {
        let mut state = self.state.lock().expect("storage group lock poisoned");
        if !location.storage.is_none() {
            if let Some(record) = state.find(location.storage) {
                return Ok((record.id, location.file, record.backend.clone()));
            }
        }
        let record = state.select(size, self.rotation_threshold)?;
        Ok((record.id, FileId::NONE, record.backend))
    }

    /// Write a blob and update `location` with where it landed.
    pub async fn put(&self, location: &mut BlobLocation, data: Bytes) -> CrystalResult<()> {
        let (storage, file, backend) = self.route(location, data.len() as u64)?;
        let file = backend.put(file, data).await?;
        *location = BlobLocation::new(storage, file);
        Ok(())
    }

    pub async fn get(&self, location: &BlobLocation) -> CrystalResult<Bytes> {
        let backend = self.backend(location.storage)?;
        backend.get(location.file).await
    }

    /// Delete a blob and clear `location` on success.
    pub async fn delete(&self, location: &mut BlobLocation) -> CrystalResult<()> {
        let backend = self.backend(location.storage)?;
        backend.delete(location.file).await?;
        location.clear();
        Ok(())
    }

    pub fn put_blocking(&self, location: &mut BlobLocation, data: Bytes) -> CrystalResult<()> {
        let (storage, file, backend) = self.route(location, data.len() as u64)?;
        let file = backend.put_blocking(file, data)?;
        *location = BlobLocation::new(storage, file);
        Ok(())
    }

    pub fn get_blocking(&self, location: &BlobLocation) -> CrystalResult<Bytes> {
        self.backend(location.storage)?.get_blocking(location.file)
    }

    pub fn delete_blocking(&self, location: &mut BlobLocation) -> CrystalResult<()> {
        self.backend(location.storage)?
            .delete_blocking(location.file)?;
        location.clear();
        Ok(())
    }

    /// Prepare every backend in insertion order.
    pub async fn prepare_backends(&self) -> CrystalResult<()> {
        for record in self.records() {
            record.backend.prepare().await?;
        }
        Ok(())
    }

    /// Persist every backend's metadata. Tries all backends and returns the
    /// first failure.
    pub async fn save_backends(&self) -> CrystalResult<()> {
        let mut first_error = None;
        for record in self.records() {
            if let Err(err) = record.backend.save().await {
                warn!(storage = %record.id, error = %err, "failed to save storage metadata");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simple::SimpleStorage;
    use crystal_filer::{BucketFiler, InMemoryBucket};
    use proptest::prelude::*;

    fn bucket_backend(name: &str) -> (FilerConfiguration, Arc<dyn StorageBackend>) {
        let client = Arc::new(InMemoryBucket::new());
        let filer = Arc::new(BucketFiler::new(client, "test", name));
        (
            FilerConfiguration::bucket("test", name).with_capacity(100),
            Arc::new(SimpleStorage::new(filer)),
        )
    }

    fn group(threshold: u64) -> StorageGroup {
        StorageGroup::new(&StorageGroupConfiguration {
            rotation_threshold: threshold,
        })
    }

    #[tokio::test]
    async fn put_without_storage_is_no_storage() {
        let group = group(50);
        let mut location = BlobLocation::NONE;
        let err = group
            .put(&mut location, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err, CrystalError::NoStorage);
    }

    #[test]
    fn duplicate_path_rejected() {
        let group = group(50);
        let (config, backend) = bucket_backend("a");
        group.add_storage(config.clone(), backend.clone()).unwrap();
        let err = group.add_storage(config, backend).unwrap_err();
        assert!(matches!(err, CrystalError::DuplicatePath(_)));
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn storage_ids_are_nonzero_and_unique() {
        let group = group(50);
        let mut ids = Vec::new();
        for i in 0..20 {
            let (config, backend) = bucket_backend(&format!("s{i}"));
            ids.push(group.add_storage(config, backend).unwrap());
        }
        assert!(ids.iter().all(|id| !id.is_none()));
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
    }

    #[tokio::test]
    async fn rotation_picks_lower_ratio() {
        let group = group(50);
        let (config_a, backend_a) = bucket_backend("a");
        let (config_b, backend_b) = bucket_backend("b");
        let a = group.add_storage(config_a, backend_a).unwrap();
        let b = group.add_storage(config_b, backend_b).unwrap();

        // Nothing selected yet: ties go to the first record.
        let mut first = BlobLocation::NONE;
        group
            .put(&mut first, Bytes::from(vec![0u8; 30]))
            .await
            .unwrap();
        assert_eq!(first.storage, a);

        // Counter 60 > 50: re-pick; b has the lower ratio.
        let mut second = BlobLocation::NONE;
        group
            .put(&mut second, Bytes::from(vec![0u8; 30]))
            .await
            .unwrap();
        assert_eq!(second.storage, b);

        // Counter reset to 30, so this one stays on b.
        let mut third = BlobLocation::NONE;
        group
            .put(&mut third, Bytes::from(vec![0u8; 10]))
            .await
            .unwrap();
        assert_eq!(third.storage, b);

        let usage = group.usage();
        assert_eq!(usage[0].used, 30);
        assert_eq!(usage[1].used, 40);
        assert!((usage[1].ratio - 0.4).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn existing_location_stays_on_its_backend() {
        let group = group(1);
        let (config_a, backend_a) = bucket_backend("a");
        let (config_b, backend_b) = bucket_backend("b");
        group.add_storage(config_a, backend_a).unwrap();
        group.add_storage(config_b, backend_b).unwrap();

        let mut location = BlobLocation::NONE;
        group
            .put(&mut location, Bytes::from(vec![1u8; 40]))
            .await
            .unwrap();
        let original = location;
        group
            .put(&mut location, Bytes::from(vec![2u8; 10]))
            .await
            .unwrap();
        assert_eq!(location, original);
        assert_eq!(&group.get(&location).await.unwrap()[..], &[2u8; 10][..]);
    }

    #[tokio::test]
    async fn get_unknown_storage_is_not_found() {
        let group = group(50);
        let unknown = BlobLocation::new(StorageId::new(7), FileId::new(1));
        assert_eq!(group.get(&unknown).await.unwrap_err(), CrystalError::NotFound);
        assert_eq!(
            group.get(&BlobLocation::NONE).await.unwrap_err(),
            CrystalError::NotFound
        );
    }

    #[tokio::test]
    async fn delete_clears_location() {
        let group = group(50);
        let (config, backend) = bucket_backend("a");
        group.add_storage(config, backend).unwrap();

        let mut location = BlobLocation::NONE;
        group
            .put(&mut location, Bytes::from_static(b"bye"))
            .await
            .unwrap();
        assert!(location.is_persisted());
        group.delete(&mut location).await.unwrap();
        assert_eq!(location, BlobLocation::NONE);
        assert_eq!(group.usage()[0].used, 0);
    }

    #[test]
    fn storage_map_restores_ids() {
        let group_a = group(50);
        let (config, backend) = bucket_backend("a");
        let id = group_a.add_storage(config, backend.clone()).unwrap();
        let map = group_a.storage_map();

        let group_b = group(50);
        for entry in map {
            group_b.restore_record(entry, backend.clone()).unwrap();
        }
        assert!(group_b.backend(id).is_ok());
        assert_eq!(group_b.storage_map(), group_a.storage_map());
    }

    #[test]
    fn storage_map_survives_sealed_bincode() {
        let group = group(50);
        let (config, backend) = bucket_backend("a");
        group
            .add_storage(config.with_capacity(900), backend)
            .unwrap();
        let map = group.storage_map();
        let frame = crystal_checksum::seal_bincode(&map).unwrap();
        let decoded: Vec<StorageMapEntry> = crystal_checksum::open_bincode(&frame).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(decoded[0].capacity, 900);
    }

    #[test]
    fn usage_ratio_zero_capacity() {
        assert_eq!(usage_ratio(500, 0), 0.0);
        assert_eq!(usage_ratio(200, 100), 1.0);
        assert_eq!(usage_ratio(25, 100), 0.25);
    }

    proptest! {
        #[test]
        fn usage_ratio_is_bounded(used in any::<u64>(), capacity in any::<u64>()) {
            let ratio = usage_ratio(used, capacity);
            prop_assert!((0.0..=1.0).contains(&ratio));
            if capacity == 0 {
                prop_assert_eq!(ratio, 0.0);
            }
        }
    }
}
