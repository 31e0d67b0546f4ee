use std::io;

use thiserror::Error;

/// Result codes returned by every Crystal operation.
///
/// Expected failure paths are values of this enum, never panics. Panics are
/// reserved for configuration mistakes made by the embedding program (for
/// example registering the same datum type id twice).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrystalError {
    /// No filer is configured (or the configured bucket has no client).
    #[error("no filer configured")]
    NoFiler,

    /// No storage backend is registered to receive the write.
    #[error("no storage registered")]
    NoStorage,

    /// The value has never been written.
    #[error("no data")]
    NoData,

    /// The storage id, node, or book range could not be resolved.
    #[error("not found")]
    NotFound,

    /// The underlying file or blob does not exist.
    #[error("no such file")]
    NoFile,

    /// A payload exceeds its configured size bound.
    #[error("size {size} exceeds limit {limit}")]
    OverSizeLimit { size: usize, limit: usize },

    /// A collection would exceed its configured entry count.
    #[error("count {count} exceeds limit {limit}")]
    OverNumberLimit { count: usize, limit: usize },

    /// A checksum did not match the stored bytes.
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// Stored bytes could not be decoded.
    #[error("deserialize error: {0}")]
    DeserializeError(String),

    /// A value could not be encoded.
    #[error("serialize error: {0}")]
    SerializeError(String),

    /// The data node has been deleted.
    #[error("data node is deleted")]
    Deleted,

    /// The datum type was never registered with the datum registry.
    #[error("datum type not registered: {0}")]
    DatumNotRegistered(&'static str),

    /// A backend for this path is already registered.
    #[error("path already registered: {0}")]
    DuplicatePath(String),

    /// The recovery policy chose to abort.
    #[error("aborted by recovery policy")]
    Aborted,

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Coarse taxonomy of [`CrystalError`] used by callers to decide on recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Not ready / not found; treat as "value absent".
    Absent,
    /// The request violated a configured bound. Never retried.
    Capacity,
    /// Checksum mismatch or decode failure.
    Integrity,
    /// Operation on a deleted node or unregistered datum.
    Lifecycle,
    /// Transport or file-system failure.
    Io,
    /// Stopped by a recovery policy.
    Aborted,
}

impl CrystalError {
    /// The taxonomy class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NoFiler | Self::NoStorage | Self::NoData | Self::NotFound | Self::NoFile => {
                ErrorClass::Absent
            }
            Self::OverSizeLimit { .. } | Self::OverNumberLimit { .. } => ErrorClass::Capacity,
            Self::CorruptedData(_) | Self::DeserializeError(_) | Self::SerializeError(_) => {
                ErrorClass::Integrity
            }
            Self::Deleted | Self::DatumNotRegistered(_) => ErrorClass::Lifecycle,
            Self::DuplicatePath(_) | Self::Io(_) => ErrorClass::Io,
            Self::Aborted => ErrorClass::Aborted,
        }
    }

    /// Returns `true` if the error only means the file does not exist yet.
    pub fn is_no_file(&self) -> bool {
        matches!(self, Self::NoFile)
    }

    /// Shorthand for a bincode (or other codec) decode failure.
    pub fn deserialize(err: impl std::fmt::Display) -> Self {
        Self::DeserializeError(err.to_string())
    }

    /// Shorthand for a codec encode failure.
    pub fn serialize(err: impl std::fmt::Display) -> Self {
        Self::SerializeError(err.to_string())
    }
}

impl From<io::Error> for CrystalError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NoFile
        } else {
            Self::Io(err.to_string())
        }
    }
}

/// Result alias used throughout Crystal.
pub type CrystalResult<T> = Result<T, CrystalError>;
