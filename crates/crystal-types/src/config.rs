use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CrystalError, CrystalResult};

/// Where raw bytes live: nowhere, a local directory, or a remote bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilerConfiguration {
    #[default]
    Empty,
    LocalDirectory {
        path: PathBuf,
        #[serde(default)]
        capacity: Option<u64>,
    },
    RemoteBucket {
        bucket: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        capacity: Option<u64>,
    },
}

impl FilerConfiguration {
    /// Local directory with no capacity bound.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::LocalDirectory {
            path: path.into(),
            capacity: None,
        }
    }

    /// Remote bucket with a key prefix and no capacity bound.
    pub fn bucket(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self::RemoteBucket {
            bucket: bucket.into(),
            path: path.into(),
            capacity: None,
        }
    }

    /// Same configuration with the capacity set.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        match &mut self {
            Self::Empty => {}
            Self::LocalDirectory { capacity, .. } | Self::RemoteBucket { capacity, .. } => {
                *capacity = Some(bytes)
            }
        }
        self
    }

    /// Configured capacity in bytes; `0` when unbounded.
    pub fn capacity(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::LocalDirectory { capacity, .. } | Self::RemoteBucket { capacity, .. } => {
                capacity.unwrap_or(0)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Canonical key used to detect two configurations addressing the same place.
    pub fn location_key(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::LocalDirectory { path, .. } => format!("local:{}", path.display()),
            Self::RemoteBucket { bucket, path, .. } => {
                format!("bucket:{}/{}", bucket, path.trim_matches('/'))
            }
        }
    }
}

/// Storage implementation backing a crystal's data-node tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfiguration {
    #[default]
    Empty,
    /// One blob-per-file storage rooted at the given filer.
    Simple { directory: FilerConfiguration },
}

/// Configuration of one registered root object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrystalConfiguration {
    /// Directory (or bucket prefix) holding the snapshot file.
    pub directory: FilerConfiguration,
    /// Snapshot file name inside `directory`.
    pub file_name: String,
    /// Optional directory for the backup copy.
    #[serde(default)]
    pub backup: Option<FilerConfiguration>,
    /// Storage for datum payloads of tree-shaped roots.
    #[serde(default)]
    pub storage: StorageConfiguration,
    /// Journal token identifying this crystal's records.
    #[serde(default)]
    pub plane: u32,
}

impl CrystalConfiguration {
    pub fn new(directory: FilerConfiguration, file_name: impl Into<String>) -> Self {
        Self {
            directory,
            file_name: file_name.into(),
            backup: None,
            storage: StorageConfiguration::Empty,
            plane: 0,
        }
    }

    pub fn with_backup(mut self, backup: FilerConfiguration) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn with_storage(mut self, storage: StorageConfiguration) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_plane(mut self, plane: u32) -> Self {
        self.plane = plane;
        self
    }
}

/// Journal sizing and placement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfiguration {
    pub directory: FilerConfiguration,
    /// Largest accepted record, header included.
    pub max_record_length: usize,
    /// Capacity of the temporary buffer before it spills into a book.
    pub book_size: usize,
    /// Period of the background persistence loop.
    pub persist_interval_ms: u64,
}

impl Default for JournalConfiguration {
    fn default() -> Self {
        Self {
            directory: FilerConfiguration::Empty,
            max_record_length: 16 * 1024,
            book_size: 1024 * 1024,
            persist_interval_ms: 1000,
        }
    }
}

impl JournalConfiguration {
    pub fn new(directory: FilerConfiguration) -> Self {
        Self {
            directory,
            ..Self::default()
        }
    }
}

/// Storage router tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageGroupConfiguration {
    /// Bytes written to the current backend before re-picking the least used.
    pub rotation_threshold: u64,
}

impl Default for StorageGroupConfiguration {
    fn default() -> Self {
        Self {
            rotation_threshold: 100 * 1024 * 1024,
        }
    }
}

/// Top-level registry configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfiguration {
    /// Where the storage map and other registry metadata are kept.
    #[serde(default)]
    pub metadata: FilerConfiguration,
    #[serde(default)]
    pub journal: Option<JournalConfiguration>,
    #[serde(default)]
    pub storage: StorageGroupConfiguration,
}

impl RegistryConfiguration {
    /// Parse from TOML text.
    pub fn from_toml_str(text: &str) -> CrystalResult<Self> {
        toml::from_str(text).map_err(CrystalError::deserialize)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> CrystalResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML text.
    pub fn to_toml_string(&self) -> CrystalResult<String> {
        toml::to_string(self).map_err(CrystalError::serialize)
    }
}
