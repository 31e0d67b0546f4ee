use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crystal_checksum::{open_bincode, seal_bincode};
use crystal_filer::RawFiler;
use crystal_types::{CrystalError, CrystalResult, FileId};

use crate::backend::StorageBackend;

/// Name of the sealed metadata file at the backend root.
pub const METADATA_FILE: &str = "storage.meta";

/// Relative path of a blob: top byte as a two-digit directory, then the full
/// id as eight hex digits.
pub fn blob_path(id: u32) -> String {
    format!("{:02x}/{:08x}", id >> 24, id)
}

fn parse_blob_path(path: &str) -> Option<u32> {
    let (dir, name) = path.split_once('/')?;
    if dir.len() != 2 || name.len() != 8 {
        return None;
    }
    let id = u32::from_str_radix(name, 16).ok()?;
    let top = u32::from_str_radix(dir, 16).ok()?;
    (id != 0 && top == id >> 24).then_some(id)
}

fn raw_id(file: FileId) -> CrystalResult<u32> {
    u32::try_from(file.get())
        .ok()
        .filter(|id| *id != 0)
        .ok_or(CrystalError::NotFound)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageMetadata {
    files: BTreeMap<u32, u64>,
}

#[derive(Debug, Default)]
struct SimpleState {
    files: HashMap<u32, u64>,
    used: u64,
    dirty: bool,
}

impl SimpleState {
    /// Reserve a fresh random id with a zero-size entry.
    fn allocate(&mut self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u32 = rng.gen();
            if id != 0 && !self.files.contains_key(&id) {
                self.files.insert(id, 0);
                return id;
            }
        }
    }

    fn record(&mut self, id: u32, size: u64) {
        let old = self.files.insert(id, size).unwrap_or(0);
        self.used = self.used.saturating_sub(old) + size;
        self.dirty = true;
    }

    fn forget(&mut self, id: u32) -> Option<u64> {
        let size = self.files.remove(&id)?;
        self.used = self.used.saturating_sub(size);
        self.dirty = true;
        Some(size)
    }

    fn install(&mut self, files: impl IntoIterator<Item = (u32, u64)>) {
        self.files = files.into_iter().collect();
        self.used = self.files.values().sum();
    }
}

/// Blob-per-file storage over a [`RawFiler`].
///
/// Keeps a `blob id -> size` map in memory for id allocation and usage
/// accounting, persisted to [`METADATA_FILE`] on [`StorageBackend::save`].
/// On prepare the map is checked against a listing of the medium, which
/// wins whenever the two disagree.
#[derive(Debug)]
pub struct SimpleStorage {
    filer: Arc<dyn RawFiler>,
    state: Mutex<SimpleState>,
}

impl SimpleStorage {
    pub fn new(filer: Arc<dyn RawFiler>) -> Self {
        Self {
            filer,
            state: Mutex::new(SimpleState::default()),
        }
    }

    /// The filer this backend writes through.
    pub fn filer(&self) -> &Arc<dyn RawFiler> {
        &self.filer
    }

    /// Pick the id for a write. Returns the id and whether it was freshly
    /// reserved.
    fn begin_put(&self, file: FileId) -> CrystalResult<(u32, bool)> {
        if file.is_none() {
            let mut state = self.state.lock().expect("storage lock poisoned");
            Ok((state.allocate(), true))
        } else {
            Ok((raw_id(file)?, false))
        }
    }

    fn finish_put(
        &self,
        id: u32,
        fresh: bool,
        size: u64,
        written: CrystalResult<()>,
    ) -> CrystalResult<FileId> {
        let mut state = self.state.lock().expect("storage lock poisoned");
        match written {
            Ok(()) => {
                state.record(id, size);
                Ok(FileId::new(u64::from(id)))
            }
            Err(err) => {
                if fresh {
                    state.forget(id);
                }
                Err(err)
            }
        }
    }

    /// Drop the size entry after a delete. A blob that is neither tracked
    /// nor on the medium is `NoFile`.
    fn finish_delete(&self, id: u32, removed: CrystalResult<()>) -> CrystalResult<()> {
        let tracked = self
            .state
            .lock()
            .expect("storage lock poisoned")
            .forget(id)
            .is_some();
        match removed {
            Ok(()) => Ok(()),
            Err(CrystalError::NoFile) if tracked => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Blob files actually present, by id.
    async fn listed(&self) -> CrystalResult<BTreeMap<u32, u64>> {
        let entries = self.filer.list("").await?;
        Ok(entries
            .iter()
            .filter_map(|entry| parse_blob_path(&entry.path).map(|id| (id, entry.size)))
            .collect())
    }

    /// Install the listed blobs as the size map. Marked dirty so the next
    /// save rewrites the metadata.
    fn install_listing(&self, listed: BTreeMap<u32, u64>, reason: &str) {
        let mut state = self.state.lock().expect("storage lock poisoned");
        state.install(listed);
        state.dirty = true;
        info!(
            storage = %self.filer.describe(),
            files = state.files.len(),
            used = state.used,
            reason,
            "rebuilt storage metadata from listing"
        );
    }
}

#[async_trait]
impl StorageBackend for SimpleStorage {
    async fn prepare(&self) -> CrystalResult<()> {
        let loaded = match self.filer.read(METADATA_FILE).await {
            Ok(frame) => match open_bincode::<StorageMetadata>(&frame) {
                Ok(metadata) => Some(metadata.files),
                Err(err) => {
                    warn!(storage = %self.filer.describe(), error = %err, "storage metadata unreadable");
                    None
                }
            },
            Err(CrystalError::NoFile) => None,
            Err(err) => return Err(err),
        };
        let listed = self.listed().await?;

        match loaded {
            Some(files) if files == listed => {
                let mut state = self.state.lock().expect("storage lock poisoned");
                state.install(files);
                state.dirty = false;
                debug!(
                    storage = %self.filer.describe(),
                    files = state.files.len(),
                    used = state.used,
                    "loaded storage metadata"
                );
            }
            Some(files) => {
                warn!(
                    storage = %self.filer.describe(),
                    recorded = files.len(),
                    present = listed.len(),
                    "storage metadata is stale"
                );
                self.install_listing(listed, "stale");
            }
            None => self.install_listing(listed, "missing"),
        }
        Ok(())
    }

    async fn get(&self, file: FileId) -> CrystalResult<Bytes> {
        let id = raw_id(file)?;
        self.filer.read(&blob_path(id)).await
    }

    async fn put(&self, file: FileId, data: Bytes) -> CrystalResult<FileId> {
        let (id, fresh) = self.begin_put(file)?;
        let size = data.len() as u64;
        let written = self.filer.write(&blob_path(id), data).await;
        self.finish_put(id, fresh, size, written)
    }

    async fn delete(&self, file: FileId) -> CrystalResult<()> {
        let id = raw_id(file)?;
        let removed = self.filer.delete(&blob_path(id)).await;
        self.finish_delete(id, removed)
    }

    async fn save(&self) -> CrystalResult<()> {
        let metadata = {
            let mut state = self.state.lock().expect("storage lock poisoned");
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            StorageMetadata {
                files: state.files.iter().map(|(k, v)| (*k, *v)).collect(),
            }
        };
        let frame = seal_bincode(&metadata)?;
        if let Err(err) = self.filer.write(METADATA_FILE, frame).await {
            self.state.lock().expect("storage lock poisoned").dirty = true;
            return Err(err);
        }
        debug!(storage = %self.filer.describe(), files = metadata.files.len(), "saved storage metadata");
        Ok(())
    }

    fn get_blocking(&self, file: FileId) -> CrystalResult<Bytes> {
        let id = raw_id(file)?;
        self.filer.read_blocking(&blob_path(id))
    }

    fn put_blocking(&self, file: FileId, data: Bytes) -> CrystalResult<FileId> {
        let (id, fresh) = self.begin_put(file)?;
        let size = data.len() as u64;
        let written = self.filer.write_blocking(&blob_path(id), data);
        self.finish_put(id, fresh, size, written)
    }

    fn delete_blocking(&self, file: FileId) -> CrystalResult<()> {
        let id = raw_id(file)?;
        let removed = self.filer.delete_blocking(&blob_path(id));
        self.finish_delete(id, removed)
    }

    fn used_bytes(&self) -> u64 {
        self.state.lock().expect("storage lock poisoned").used
    }

    fn file_count(&self) -> usize {
        self.state.lock().expect("storage lock poisoned").files.len()
    }
}
