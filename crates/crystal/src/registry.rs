//! Registry of crystals sharing one storage router, datum registry and
//! journal.
//!
//! Crystal types are registered up front with
//! [`CrystalRegistryBuilder::register`]; each registration stores a factory
//! keyed by the type's `TypeId`. Handles are prepared on first use, either by
//! [`CrystalRegistry::prepare_and_load_all`] or lazily by
//! [`CrystalRegistry::object_for`].

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crystal_checksum::{open_bincode, seal_bincode};
use crystal_data::{Datum, DatumRegistry, MemoryUsage};
use crystal_filer::{BucketClient, FilerResolver, RawFiler};
use crystal_journal::Journal;
use crystal_storage::{SimpleStorage, StorageBackend, StorageGroup, StorageMapEntry};
use crystal_types::{CrystalConfiguration, CrystalError, CrystalResult, RegistryConfiguration};

use crate::context::CrystalContext;
use crate::handle::{CrystalHandle, ManagedCrystal, Shared};
use crate::object::CrystalObject;
use crate::recovery::{AbortPolicy, RecoveryPolicy};

/// Name of the sealed storage map inside the metadata filer.
pub const STORAGE_MAP_FILE: &str = "storage.map";

type HandleFuture = Pin<Box<dyn Future<Output = CrystalResult<Arc<dyn ManagedCrystal>>> + Send>>;
type HandleFactory = fn(CrystalConfiguration, FilerResolver, CrystalContext) -> HandleFuture;

fn make_handle<T: CrystalObject>(
    configuration: CrystalConfiguration,
    resolver: FilerResolver,
    context: CrystalContext,
) -> HandleFuture {
    Box::pin(async move {
        let handle = CrystalHandle::<T>::prepare(configuration, &resolver, context).await?;
        Ok(Arc::new(handle) as Arc<dyn ManagedCrystal>)
    })
}

struct CrystalEntry {
    name: &'static str,
    configuration: CrystalConfiguration,
    factory: HandleFactory,
    handle: OnceCell<Arc<dyn ManagedCrystal>>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects crystal types, datum types and bucket clients before the
/// registry is built.
pub struct CrystalRegistryBuilder {
    configuration: RegistryConfiguration,
    resolver: FilerResolver,
    datums: DatumRegistry,
    policy: Arc<dyn RecoveryPolicy>,
    crystals: Vec<CrystalEntry>,
    by_type: HashMap<TypeId, usize>,
}

impl CrystalRegistryBuilder {
    pub fn new(configuration: RegistryConfiguration) -> Self {
        Self {
            configuration,
            resolver: FilerResolver::new(),
            datums: DatumRegistry::new(),
            policy: Arc::new(AbortPolicy),
            crystals: Vec::new(),
            by_type: HashMap::new(),
        }
    }

    /// Serve `bucket` through `client`.
    pub fn bucket(mut self, bucket: impl Into<String>, client: Arc<dyn BucketClient>) -> Self {
        self.resolver.register_bucket(bucket, client);
        self
    }

    /// Register datum type `D` under `type_id`.
    pub fn datum<D, F>(mut self, type_id: u16, factory: F) -> Self
    where
        D: Datum,
        F: Fn() -> D + Send + Sync + 'static,
    {
        self.datums.register(type_id, factory);
        self
    }

    /// Policy used by [`CrystalRegistry::object_for`] when both snapshot
    /// copies are unusable. Defaults to [`AbortPolicy`].
    pub fn policy(mut self, policy: impl RecoveryPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Register crystal type `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is already registered.
    pub fn register<T: CrystalObject>(mut self, configuration: CrystalConfiguration) -> Self {
        let type_id = TypeId::of::<T>();
        if self.by_type.contains_key(&type_id) {
            panic!("crystal type {} registered twice", type_name::<T>());
        }
        self.by_type.insert(type_id, self.crystals.len());
        self.crystals.push(CrystalEntry {
            name: type_name::<T>(),
            configuration,
            factory: make_handle::<T>,
            handle: OnceCell::new(),
        });
        self
    }

    /// Resolve the journal and metadata filers and build the registry.
    pub fn build(self) -> CrystalResult<CrystalRegistry> {
        let journal = self
            .configuration
            .journal
            .as_ref()
            .map(|config| {
                self.resolver
                    .resolve(&config.directory)
                    .map(|filer| Arc::new(Journal::new(config.clone(), filer)))
            })
            .transpose()?;
        let metadata = if self.configuration.metadata.is_empty() {
            None
        } else {
            Some(self.resolver.resolve(&self.configuration.metadata)?)
        };

        Ok(CrystalRegistry {
            storage: Arc::new(StorageGroup::new(&self.configuration.storage)),
            resolver: self.resolver,
            datums: Arc::new(self.datums),
            usage: Arc::new(MemoryUsage::new()),
            journal,
            metadata,
            policy: self.policy,
            crystals: self.crystals,
            by_type: self.by_type,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owner of every registered crystal and the services they share.
pub struct CrystalRegistry {
    resolver: FilerResolver,
    storage: Arc<StorageGroup>,
    datums: Arc<DatumRegistry>,
    usage: Arc<MemoryUsage>,
    journal: Option<Arc<Journal>>,
    metadata: Option<Arc<dyn RawFiler>>,
    policy: Arc<dyn RecoveryPolicy>,
    crystals: Vec<CrystalEntry>,
    by_type: HashMap<TypeId, usize>,
}

impl fmt::Debug for CrystalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.crystals.iter().map(|c| c.name).collect();
        f.debug_struct("CrystalRegistry")
            .field("crystals", &names)
            .field("storages", &self.storage.len())
            .field("journal", &self.journal.is_some())
            .finish()
    }
}

impl CrystalRegistry {
    pub fn builder(configuration: RegistryConfiguration) -> CrystalRegistryBuilder {
        CrystalRegistryBuilder::new(configuration)
    }

    pub fn storage(&self) -> &Arc<StorageGroup> {
        &self.storage
    }

    pub fn journal(&self) -> Option<&Arc<Journal>> {
        self.journal.as_ref()
    }

    pub fn datums(&self) -> &Arc<DatumRegistry> {
        &self.datums
    }

    /// Bytes currently held by loaded datums across all crystals.
    pub fn memory_usage(&self) -> i64 {
        self.usage.current()
    }

    /// Type names of the registered crystals, in registration order.
    pub fn crystal_names(&self) -> Vec<&'static str> {
        self.crystals.iter().map(|c| c.name).collect()
    }

    fn entry<T: CrystalObject>(&self) -> &CrystalEntry {
        match self.by_type.get(&TypeId::of::<T>()) {
            Some(index) => &self.crystals[*index],
            None => panic!("crystal type {} was never registered", type_name::<T>()),
        }
    }

    fn context_for(&self, entry: &CrystalEntry) -> CrystalContext {
        CrystalContext {
            datums: self.datums.clone(),
            storage: self.storage.clone(),
            usage: self.usage.clone(),
            journal: self.journal.clone(),
            plane: entry.configuration.plane,
        }
    }

    async fn managed<'a>(&self, entry: &'a CrystalEntry) -> CrystalResult<&'a Arc<dyn ManagedCrystal>> {
        entry
            .handle
            .get_or_try_init(|| {
                (entry.factory)(
                    entry.configuration.clone(),
                    self.resolver.clone(),
                    self.context_for(entry),
                )
            })
            .await
    }

    /// Handle of crystal type `T`, prepared on first use.
    ///
    /// # Panics
    ///
    /// Panics if `T` was never registered.
    pub async fn handle<T: CrystalObject>(&self) -> CrystalResult<&CrystalHandle<T>> {
        let managed = self.managed(self.entry::<T>()).await?;
        managed
            .as_any()
            .downcast_ref::<CrystalHandle<T>>()
            .ok_or(CrystalError::NotFound)
    }

    /// Root object of crystal type `T`, loading it on first use.
    ///
    /// # Panics
    ///
    /// Panics if `T` was never registered.
    pub async fn object_for<T: CrystalObject>(&self) -> CrystalResult<Shared<T>> {
        self.handle::<T>().await?.object(self.policy.as_ref()).await
    }

    /// Prepare the journal, restore storages, then load every crystal in
    /// registration order. Starts the journal loop on success.
    pub async fn prepare_and_load_all(&self, policy: &dyn RecoveryPolicy) -> CrystalResult<()> {
        if let Some(journal) = &self.journal {
            journal.prepare().await?;
        }
        self.restore_storage_map().await?;

        for entry in &self.crystals {
            let loaded = match self.managed(entry).await {
                Ok(managed) => managed.load(policy).await,
                Err(err) => Err(err),
            };
            if let Err(err) = loaded {
                error!(crystal = entry.name, error = %err, "crystal failed to load");
                return Err(err);
            }
        }

        if let Some(journal) = &self.journal {
            journal.start();
        }
        info!(
            crystals = self.crystals.len(),
            storages = self.storage.len(),
            "registry loaded"
        );
        Ok(())
    }

    /// Save every loaded crystal, backend metadata and the storage map.
    pub async fn save_all(&self) -> CrystalResult<()> {
        let mut result = self.save_crystals(false).await;
        result = result.and(self.storage.save_backends().await);
        result.and(self.save_storage_map().await)
    }

    /// Save and unload every crystal, persist storage metadata, then stop the
    /// journal. Every step runs; the first failure is returned.
    pub async fn save_and_terminate_all(&self) -> CrystalResult<()> {
        let mut result = self.save_crystals(true).await;
        result = result.and(self.storage.save_backends().await);
        result = result.and(self.save_storage_map().await);
        if let Some(journal) = &self.journal {
            result = result.and(journal.terminate().await);
        }
        match &result {
            Ok(()) => info!("registry terminated"),
            Err(err) => error!(error = %err, "registry terminated with errors"),
        }
        result
    }

    /// Remove the snapshot files of crystal type `T` and reset its handle.
    pub async fn delete<T: CrystalObject>(&self) -> CrystalResult<()> {
        self.handle::<T>().await?.delete().await
    }

    async fn save_crystals(&self, unload: bool) -> CrystalResult<()> {
        let mut first = None;
        for entry in &self.crystals {
            let Some(managed) = entry.handle.get() else {
                continue;
            };
            if let Err(err) = managed.save(unload).await {
                error!(crystal = managed.name(), error = %err, "crystal save failed");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn restore_storage_map(&self) -> CrystalResult<()> {
        let Some(metadata) = &self.metadata else {
            return Ok(());
        };
        let entries: Vec<StorageMapEntry> = match metadata.read(STORAGE_MAP_FILE).await {
            Ok(frame) => open_bincode(&frame)?,
            Err(CrystalError::NoFile) => return Ok(()),
            Err(err) => return Err(err),
        };
        for entry in entries {
            if self.storage.find_by_location(&entry.configuration).is_some() {
                continue;
            }
            let backend = Arc::new(SimpleStorage::new(self.resolver.resolve(&entry.configuration)?));
            backend.prepare().await?;
            self.storage.restore_record(entry, backend)?;
        }
        debug!(storages = self.storage.len(), "storage map restored");
        Ok(())
    }

    async fn save_storage_map(&self) -> CrystalResult<()> {
        let Some(metadata) = &self.metadata else {
            return Ok(());
        };
        let frame = seal_bincode(&self.storage.storage_map())?;
        metadata.write(STORAGE_MAP_FILE, frame).await
    }
}
