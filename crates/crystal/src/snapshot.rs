//! Checksummed snapshot files with an optional backup copy.
//!
//! A snapshot `name` is accompanied by `name.waypoint`, a 20-byte record
//! holding the snapshot's content hash and, when a journal is attached, the
//! journal position of the `Check` record written at save time. Loading
//! verifies the hash before handing the bytes out.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crystal_checksum::{ContentHasher, Waypoint};
use crystal_filer::RawFiler;
use crystal_journal::{Journal, JournalRecordType};
use crystal_types::{CrystalError, CrystalResult};

use crate::recovery::{RecoveryDecision, RecoveryPolicy};

/// One place a snapshot is written to.
#[derive(Clone, Debug)]
pub struct SnapshotTarget {
    pub filer: Arc<dyn RawFiler>,
    pub path: String,
}

impl SnapshotTarget {
    pub fn new(filer: Arc<dyn RawFiler>, path: impl Into<String>) -> Self {
        Self {
            filer,
            path: path.into(),
        }
    }

    pub fn waypoint_path(&self) -> String {
        Waypoint::companion_path(&self.path)
    }

    pub fn describe(&self) -> String {
        format!("{}/{}", self.filer.describe(), self.path)
    }

    /// Remove the snapshot and its waypoint. Missing files are ignored.
    pub async fn remove(&self) -> CrystalResult<()> {
        for path in [self.path.clone(), self.waypoint_path()] {
            match self.filer.delete(&path).await {
                Ok(()) | Err(CrystalError::NoFile) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// A verified snapshot.
#[derive(Clone, Debug)]
pub struct LoadedSnapshot {
    pub bytes: Bytes,
    pub waypoint: Waypoint,
    pub from_backup: bool,
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Write `bytes` and its waypoint to `primary`, then mirror both to `backup`.
///
/// With a journal, a `Check` record carrying the hash is appended under
/// `token` and persisted before its end position goes into the waypoint, so
/// a waypoint never points past the durable journal. Backup failures are
/// logged and swallowed.
pub async fn save(
    bytes: Bytes,
    primary: &SnapshotTarget,
    backup: Option<&SnapshotTarget>,
    journal: Option<(&Journal, u32)>,
) -> CrystalResult<Waypoint> {
    primary.filer.write(&primary.path, bytes.clone()).await?;

    let hash = ContentHasher::SNAPSHOT.hash64(&bytes);
    let waypoint = match journal {
        Some((journal, token)) => {
            let mut writer = journal.get_writer(JournalRecordType::Check, token);
            writer.put_u64_le(hash);
            let position = journal.add(writer)?;
            journal.persist().await?;
            Waypoint::new(position, token, hash)
        }
        None => Waypoint::new(0, 0, hash),
    };
    let encoded = Bytes::copy_from_slice(&waypoint.to_bytes());
    primary
        .filer
        .write(&primary.waypoint_path(), encoded.clone())
        .await?;
    info!(
        snapshot = %primary.describe(),
        size = bytes.len(),
        position = waypoint.journal_position,
        "snapshot saved"
    );

    if let Some(backup) = backup {
        let mirrored = async {
            backup.filer.write(&backup.path, bytes).await?;
            backup.filer.write(&backup.waypoint_path(), encoded).await
        };
        if let Err(err) = mirrored.await {
            warn!(snapshot = %backup.describe(), error = %err, "backup snapshot not written");
        }
    }
    Ok(waypoint)
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and verify one snapshot copy.
///
/// A missing snapshot is `NoFile`. A missing waypoint yields the bytes with
/// [`Waypoint::INVALID`]; a hash mismatch is `CorruptedData`.
pub async fn load(target: &SnapshotTarget) -> CrystalResult<(Bytes, Waypoint)> {
    let bytes = target.filer.read(&target.path).await?;
    let waypoint = match target.filer.read(&target.waypoint_path()).await {
        Ok(raw) => Waypoint::from_bytes(&raw)?,
        Err(CrystalError::NoFile) => {
            debug!(snapshot = %target.describe(), "snapshot has no waypoint");
            return Ok((bytes, Waypoint::INVALID));
        }
        Err(err) => return Err(err),
    };
    if !ContentHasher::SNAPSHOT.verify(&bytes, waypoint.hash) {
        return Err(CrystalError::CorruptedData(format!(
            "snapshot {} does not match its waypoint hash {:016x}",
            target.describe(),
            waypoint.hash
        )));
    }
    Ok((bytes, waypoint))
}

/// Load the primary copy, falling back to the backup and then to `policy`.
///
/// Returns `Ok(None)` when no snapshot exists anywhere, or when the policy
/// chose to continue with a fresh object.
pub async fn load_with_backup(
    primary: &SnapshotTarget,
    backup: Option<&SnapshotTarget>,
    policy: &dyn RecoveryPolicy,
) -> CrystalResult<Option<LoadedSnapshot>> {
    let primary_err = match load(primary).await {
        Ok((bytes, waypoint)) => {
            return Ok(Some(LoadedSnapshot {
                bytes,
                waypoint,
                from_backup: false,
            }))
        }
        Err(err) => err,
    };

    let backup_err = match backup {
        Some(backup) => match load(backup).await {
            Ok((bytes, waypoint)) => {
                warn!(
                    snapshot = %primary.describe(),
                    error = %primary_err,
                    "primary snapshot unusable, loaded backup"
                );
                return Ok(Some(LoadedSnapshot {
                    bytes,
                    waypoint,
                    from_backup: true,
                }));
            }
            Err(err) => Some(err),
        },
        None => None,
    };

    let failure = match (primary_err, backup_err) {
        (CrystalError::NoFile, None | Some(CrystalError::NoFile)) => {
            debug!(snapshot = %primary.describe(), "no snapshot present");
            return Ok(None);
        }
        (CrystalError::NoFile, Some(err)) | (err, _) => err,
    };

    let name = primary.describe();
    match policy.decide(&name, &failure).await {
        RecoveryDecision::Continue => {
            warn!(snapshot = %name, error = %failure, "snapshot unusable, starting fresh");
            Ok(None)
        }
        RecoveryDecision::Abort => {
            error!(snapshot = %name, error = %failure, "snapshot unusable, load aborted");
            Err(CrystalError::Aborted)
        }
    }
}
