//! One registered crystal: its snapshot targets and its lazily loaded root.

use std::any::{type_name, Any};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crystal_checksum::Waypoint;
use crystal_filer::FilerResolver;
use crystal_storage::{SimpleStorage, StorageBackend};
use crystal_types::{CrystalConfiguration, CrystalResult, StorageConfiguration};

use crate::context::CrystalContext;
use crate::object::CrystalObject;
use crate::recovery::RecoveryPolicy;
use crate::snapshot::{self, SnapshotTarget};

/// Shared, lockable root object.
pub type Shared<T> = Arc<RwLock<T>>;

/// Snapshot targets plus the loaded root of one crystal type.
#[derive(Debug)]
pub struct CrystalHandle<T> {
    configuration: CrystalConfiguration,
    primary: SnapshotTarget,
    backup: Option<SnapshotTarget>,
    context: CrystalContext,
    object: Mutex<Option<Shared<T>>>,
}

impl<T: CrystalObject> CrystalHandle<T> {
    /// Resolve the snapshot filers and register the crystal's storage with
    /// the router, unless a backend for that location already exists.
    pub async fn prepare(
        configuration: CrystalConfiguration,
        resolver: &FilerResolver,
        context: CrystalContext,
    ) -> CrystalResult<Self> {
        let primary = SnapshotTarget::new(
            resolver.resolve(&configuration.directory)?,
            configuration.file_name.clone(),
        );
        let backup = configuration
            .backup
            .as_ref()
            .map(|dir| {
                resolver
                    .resolve(dir)
                    .map(|filer| SnapshotTarget::new(filer, configuration.file_name.clone()))
            })
            .transpose()?;

        if let StorageConfiguration::Simple { directory } = &configuration.storage {
            if context.storage.find_by_location(directory).is_none() {
                let backend = Arc::new(SimpleStorage::new(resolver.resolve(directory)?));
                backend.prepare().await?;
                context.storage.add_storage(directory.clone(), backend)?;
            }
        }

        debug!(
            crystal = type_name::<T>(),
            snapshot = %primary.describe(),
            plane = configuration.plane,
            "crystal prepared"
        );
        Ok(Self {
            configuration,
            primary,
            backup,
            context,
            object: Mutex::new(None),
        })
    }

    pub fn configuration(&self) -> &CrystalConfiguration {
        &self.configuration
    }

    pub fn context(&self) -> &CrystalContext {
        &self.context
    }

    pub async fn is_loaded(&self) -> bool {
        self.object.lock().await.is_some()
    }

    /// The root object, loading it on first use.
    ///
    /// A missing snapshot creates a fresh object. After a snapshot with a
    /// valid waypoint, journal records of this crystal's plane are replayed.
    /// A waypoint past the journal end cannot be replayed from, so the
    /// snapshot is saved again against the current journal instead.
    pub async fn object(&self, policy: &dyn RecoveryPolicy) -> CrystalResult<Shared<T>> {
        let mut slot = self.object.lock().await;
        if let Some(object) = slot.as_ref() {
            return Ok(object.clone());
        }

        let loaded = snapshot::load_with_backup(&self.primary, self.backup.as_ref(), policy).await?;
        let object = match loaded {
            Some(loaded) => {
                let mut object = T::decode(loaded.bytes, &self.context)?;
                if let (true, Some(journal)) = (loaded.waypoint.is_valid(), &self.context.journal) {
                    let end = journal.position();
                    if loaded.waypoint.journal_position > end {
                        warn!(
                            crystal = type_name::<T>(),
                            waypoint = loaded.waypoint.journal_position,
                            journal = end,
                            "waypoint is beyond the journal end, re-anchoring snapshot"
                        );
                        let bytes = object.encode().await?;
                        let plane = self.configuration.plane;
                        snapshot::save(bytes, &self.primary, self.backup.as_ref(), Some((journal.as_ref(), plane)))
                            .await?;
                    } else {
                        let records = journal.read_records(loaded.waypoint.journal_position).await?;
                        let applied = object.replay(&records, self.configuration.plane).await?;
                        debug!(crystal = type_name::<T>(), applied, "journal replayed");
                    }
                }
                info!(
                    crystal = type_name::<T>(),
                    from_backup = loaded.from_backup,
                    "crystal loaded"
                );
                object
            }
            None => {
                info!(crystal = type_name::<T>(), "crystal created");
                T::create(&self.context)
            }
        };

        let object = Arc::new(RwLock::new(object));
        *slot = Some(object.clone());
        Ok(object)
    }

    /// Save the loaded root. Returns `Waypoint::INVALID` if it was never
    /// loaded.
    pub async fn save(&self, unload: bool) -> CrystalResult<Waypoint> {
        let Some(object) = self.object.lock().await.clone() else {
            return Ok(Waypoint::INVALID);
        };
        let object = object.read().await;
        object.save_data(unload).await?;
        let bytes = object.encode().await?;
        let journal = self
            .context
            .journal
            .as_deref()
            .map(|j| (j, self.configuration.plane));
        snapshot::save(bytes, &self.primary, self.backup.as_ref(), journal).await
    }

    /// Drop the loaded root and remove its snapshot files.
    pub async fn delete(&self) -> CrystalResult<()> {
        *self.object.lock().await = None;
        self.primary.remove().await?;
        if let Some(backup) = &self.backup {
            backup.remove().await?;
        }
        info!(crystal = type_name::<T>(), "crystal deleted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Type-erased view used by the registry
// ---------------------------------------------------------------------------

#[async_trait]
pub(crate) trait ManagedCrystal: Send + Sync {
    fn name(&self) -> &'static str;

    async fn load(&self, policy: &dyn RecoveryPolicy) -> CrystalResult<()>;

    async fn save(&self, unload: bool) -> CrystalResult<Waypoint>;

    async fn delete(&self) -> CrystalResult<()>;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<T: CrystalObject> ManagedCrystal for CrystalHandle<T> {
    fn name(&self) -> &'static str {
        type_name::<T>()
    }

    async fn load(&self, policy: &dyn RecoveryPolicy) -> CrystalResult<()> {
        self.object(policy).await.map(|_| ())
    }

    async fn save(&self, unload: bool) -> CrystalResult<Waypoint> {
        CrystalHandle::<T>::save(self, unload).await
    }

    async fn delete(&self) -> CrystalResult<()> {
        CrystalHandle::<T>::delete(self).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Document;
    use crate::recovery::AbortPolicy;
    use crystal_data::DatumRegistry;
    use crystal_storage::StorageGroup;
    use crystal_filer::LocalFiler;
    use crystal_journal::{Journal, JournalRecordType};
    use crystal_types::{FilerConfiguration, JournalConfiguration, StorageGroupConfiguration};

    fn context() -> CrystalContext {
        CrystalContext::new(
            Arc::new(DatumRegistry::new()),
            Arc::new(StorageGroup::new(&StorageGroupConfiguration::default())),
        )
    }

    #[tokio::test]
    async fn create_save_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = CrystalConfiguration::new(FilerConfiguration::local(dir.path()), "counter.bin");
        let resolver = FilerResolver::new();

        let handle = CrystalHandle::<Document<u64>>::prepare(config.clone(), &resolver, context())
            .await
            .unwrap();
        assert!(!handle.is_loaded().await);
        let counter = handle.object(&AbortPolicy).await.unwrap();
        **counter.write().await = 41;
        assert!(handle.save(false).await.unwrap().is_valid());

        let reopened = CrystalHandle::<Document<u64>>::prepare(config, &resolver, context())
            .await
            .unwrap();
        let counter = reopened.object(&AbortPolicy).await.unwrap();
        assert_eq!(**counter.read().await, 41);
    }

    #[tokio::test]
    async fn unloaded_save_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = CrystalConfiguration::new(FilerConfiguration::local(dir.path()), "idle.bin");
        let handle = CrystalHandle::<Document<u64>>::prepare(config, &FilerResolver::new(), context())
            .await
            .unwrap();
        assert!(!handle.save(false).await.unwrap().is_valid());
        assert!(!dir.path().join("idle.bin").exists());
    }

    #[tokio::test]
    async fn delete_removes_files_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let config = CrystalConfiguration::new(FilerConfiguration::local(dir.path()), "gone.bin");
        let handle = CrystalHandle::<Document<u64>>::prepare(config, &FilerResolver::new(), context())
            .await
            .unwrap();
        **handle.object(&AbortPolicy).await.unwrap().write().await = 7;
        handle.save(false).await.unwrap();

        handle.delete().await.unwrap();
        assert!(!handle.is_loaded().await);
        assert!(!dir.path().join("gone.bin").exists());
        assert!(!dir.path().join("gone.bin.waypoint").exists());
        assert_eq!(**handle.object(&AbortPolicy).await.unwrap().read().await, 0);
    }

    async fn open_journal(dir: &std::path::Path) -> Arc<Journal> {
        let journal = Journal::new(
            JournalConfiguration::new(FilerConfiguration::local(dir)),
            Arc::new(LocalFiler::new(dir)),
        );
        journal.prepare().await.unwrap();
        Arc::new(journal)
    }

    #[tokio::test]
    async fn waypoint_past_journal_end_is_reanchored() {
        let snapshots = tempfile::tempdir().unwrap();
        let journal_dir = tempfile::tempdir().unwrap();
        let config = CrystalConfiguration::new(FilerConfiguration::local(snapshots.path()), "doc.bin");
        let resolver = FilerResolver::new();

        let journal = open_journal(journal_dir.path()).await;
        for value in 0..5u64 {
            let mut writer = journal.get_writer(JournalRecordType::Value, 0);
            writer.put_u64_le(value);
            journal.add(writer).unwrap();
        }
        let handle = CrystalHandle::<Document<u64>>::prepare(
            config.clone(),
            &resolver,
            context().with_journal(journal.clone()),
        )
        .await
        .unwrap();
        **handle.object(&AbortPolicy).await.unwrap().write().await = 41;
        let stale = handle.save(false).await.unwrap();
        drop(handle);
        drop(journal);
        for entry in std::fs::read_dir(journal_dir.path()).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }

        let journal = open_journal(journal_dir.path()).await;
        assert_eq!(journal.position(), 0);
        let reopened = CrystalHandle::<Document<u64>>::prepare(
            config,
            &resolver,
            context().with_journal(journal.clone()),
        )
        .await
        .unwrap();
        let document = reopened.object(&AbortPolicy).await.unwrap();
        assert_eq!(**document.read().await, 41);

        let (_, waypoint) = snapshot::load(&reopened.primary).await.unwrap();
        assert!(waypoint.journal_position < stale.journal_position);
        assert_eq!(waypoint.journal_position, journal.position());
    }

    #[tokio::test]
    async fn simple_storage_registered_once() {
        let snapshots = tempfile::tempdir().unwrap();
        let blobs = tempfile::tempdir().unwrap();
        let ctx = context();
        let config = CrystalConfiguration::new(FilerConfiguration::local(snapshots.path()), "a.bin")
            .with_storage(StorageConfiguration::Simple {
                directory: FilerConfiguration::local(blobs.path()),
            });
        let resolver = FilerResolver::new();
        CrystalHandle::<Document<u64>>::prepare(config.clone(), &resolver, ctx.clone())
            .await
            .unwrap();
        CrystalHandle::<Document<u64>>::prepare(config, &resolver, ctx.clone())
            .await
            .unwrap();
        assert_eq!(ctx.storage.len(), 1);
    }
}
