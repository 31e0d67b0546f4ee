use async_trait::async_trait;
use bytes::Bytes;

use crystal_types::{CrystalResult, FileId};

/// One physical medium storing blobs by id.
///
/// Implementations serialize concurrent writes through their own internal
/// lock. Each async operation has a blocking twin with the same semantics
/// for callers that are not running inside a task.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Load persisted metadata so usage is known before the first write.
    async fn prepare(&self) -> CrystalResult<()>;

    async fn get(&self, file: FileId) -> CrystalResult<Bytes>;

    /// Write a blob. `FileId::NONE` allocates a fresh id; an existing id is
    /// overwritten. Returns the id the bytes were stored under.
    async fn put(&self, file: FileId, data: Bytes) -> CrystalResult<FileId>;

    /// Delete a blob. An id with no bytes on the medium and no usage entry
    /// returns `CrystalError::NoFile`.
    async fn delete(&self, file: FileId) -> CrystalResult<()>;

    /// Persist metadata.
    async fn save(&self) -> CrystalResult<()>;

    fn get_blocking(&self, file: FileId) -> CrystalResult<Bytes>;

    fn put_blocking(&self, file: FileId, data: Bytes) -> CrystalResult<FileId>;

    fn delete_blocking(&self, file: FileId) -> CrystalResult<()>;

    /// Bytes currently stored.
    fn used_bytes(&self) -> u64;

    /// Number of blobs currently stored.
    fn file_count(&self) -> usize;
}
