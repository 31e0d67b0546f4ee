use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crystal_types::{CrystalError, CrystalResult};

use crate::traits::{FileEntry, RawFiler};

/// Client for a remote object bucket.
///
/// The vendor SDK lives outside Crystal; the embedding program registers an
/// implementation of this trait with the [`crate::FilerResolver`].
#[async_trait]
pub trait BucketClient: Send + Sync + std::fmt::Debug {
    /// Fetch an object. Missing keys return `CrystalError::NoFile`.
    async fn get_object(&self, key: &str) -> CrystalResult<Bytes>;

    async fn put_object(&self, key: &str, data: Bytes) -> CrystalResult<()>;

    /// Delete an object. Missing keys return `CrystalError::NoFile`.
    async fn delete_object(&self, key: &str) -> CrystalResult<()>;

    /// List `(key, size)` pairs under a prefix.
    async fn list_objects(&self, prefix: &str) -> CrystalResult<Vec<(String, u64)>>;
}

/// In-memory bucket client.
///
/// Objects live in a `BTreeMap` behind a `RwLock` and are lost when the
/// client is dropped. Suitable for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct InMemoryBucket {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl InMemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().expect("bucket lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes across all objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects
            .read()
            .expect("bucket lock poisoned")
            .values()
            .map(|v| v.len() as u64)
            .sum()
    }
}

#[async_trait]
impl BucketClient for InMemoryBucket {
    async fn get_object(&self, key: &str) -> CrystalResult<Bytes> {
        let objects = self.objects.read().expect("bucket lock poisoned");
        objects.get(key).cloned().ok_or(CrystalError::NoFile)
    }

    async fn put_object(&self, key: &str, data: Bytes) -> CrystalResult<()> {
        let mut objects = self.objects.write().expect("bucket lock poisoned");
        objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> CrystalResult<()> {
        let mut objects = self.objects.write().expect("bucket lock poisoned");
        objects.remove(key).map(|_| ()).ok_or(CrystalError::NoFile)
    }

    async fn list_objects(&self, prefix: &str) -> CrystalResult<Vec<(String, u64)>> {
        let objects = self.objects.read().expect("bucket lock poisoned");
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.len() as u64))
            .collect())
    }
}

/// Filer addressing a key prefix inside a remote bucket.
#[derive(Clone, Debug)]
pub struct BucketFiler {
    client: Arc<dyn BucketClient>,
    bucket: String,
    prefix: String,
}

impl BucketFiler {
    pub fn new(client: Arc<dyn BucketClient>, bucket: impl Into<String>, prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        Self {
            client,
            bucket: bucket.into(),
            prefix,
        }
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path.trim_start_matches('/'))
    }

    /// Drive an async bucket call to completion from synchronous code.
    ///
    /// Requires a multi-thread tokio runtime on the calling thread.
    fn block_on<F, T>(&self, future: F) -> CrystalResult<T>
    where
        F: Future<Output = CrystalResult<T>>,
    {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| CrystalError::Io(format!("no runtime for blocking bucket call: {e}")))?;
        tokio::task::block_in_place(|| handle.block_on(future))
    }
}

#[async_trait]
impl RawFiler for BucketFiler {
    async fn read(&self, path: &str) -> CrystalResult<Bytes> {
        self.client.get_object(&self.key(path)).await
    }

    async fn write(&self, path: &str, data: Bytes) -> CrystalResult<()> {
        let key = self.key(path);
        debug!(bucket = %self.bucket, key = %key, len = data.len(), "bucket write");
        self.client.put_object(&key, data).await
    }

    async fn delete(&self, path: &str) -> CrystalResult<()> {
        self.client.delete_object(&self.key(path)).await
    }

    async fn list(&self, prefix: &str) -> CrystalResult<Vec<FileEntry>> {
        let listed = self.client.list_objects(&self.key(prefix)).await?;
        let mut entries: Vec<FileEntry> = listed
            .into_iter()
            .filter_map(|(key, size)| {
                key.strip_prefix(&self.prefix).map(|path| FileEntry {
                    path: path.to_string(),
                    size,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn read_blocking(&self, path: &str) -> CrystalResult<Bytes> {
        self.block_on(self.read(path))
    }

    fn write_blocking(&self, path: &str, data: Bytes) -> CrystalResult<()> {
        self.block_on(self.write(path, data))
    }

    fn delete_blocking(&self, path: &str) -> CrystalResult<()> {
        self.block_on(self.delete(path))
    }

    fn describe(&self) -> String {
        format!("bucket:{}/{}", self.bucket, self.prefix)
    }
}
