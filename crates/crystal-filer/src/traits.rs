use async_trait::async_trait;
use bytes::Bytes;

use crystal_types::CrystalResult;

/// A file listed by [`RawFiler::list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the filer root, `/`-separated.
    pub path: String,
    pub size: u64,
}

/// Byte storage addressed by relative path.
///
/// All implementations must satisfy these invariants:
/// - `read` of a missing path returns `CrystalError::NoFile`.
/// - `write` replaces the whole payload and creates missing parents.
/// - `delete` of a missing path returns `CrystalError::NoFile`.
/// - Blocking variants have the same semantics and must not be called from
///   inside a current-thread async runtime.
#[async_trait]
pub trait RawFiler: Send + Sync + std::fmt::Debug {
    async fn read(&self, path: &str) -> CrystalResult<Bytes>;

    async fn write(&self, path: &str, data: Bytes) -> CrystalResult<()>;

    async fn delete(&self, path: &str) -> CrystalResult<()>;

    /// List files whose path starts with `prefix`, sorted by path.
    async fn list(&self, prefix: &str) -> CrystalResult<Vec<FileEntry>>;

    fn read_blocking(&self, path: &str) -> CrystalResult<Bytes>;

    fn write_blocking(&self, path: &str, data: Bytes) -> CrystalResult<()>;

    fn delete_blocking(&self, path: &str) -> CrystalResult<()>;

    /// Human-readable description of where this filer points.
    fn describe(&self) -> String;
}
