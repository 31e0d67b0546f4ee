use crystal_types::{CrystalError, CrystalResult};

/// Size of an encoded waypoint in bytes.
pub const WAYPOINT_LENGTH: usize = 20;

/// Extension appended to a snapshot path to form its waypoint companion.
pub const WAYPOINT_EXTENSION: &str = "waypoint";

/// Checkpoint tying a snapshot file's hash to a journal position.
///
/// On-disk format (little-endian):
/// ```text
/// [8 bytes: journal position]
/// [4 bytes: token]
/// [8 bytes: content hash]
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Waypoint {
    pub journal_position: u64,
    pub token: u32,
    pub hash: u64,
}

impl Waypoint {
    /// The all-zero waypoint: "no verified checkpoint".
    pub const INVALID: Self = Self {
        journal_position: 0,
        token: 0,
        hash: 0,
    };

    pub fn new(journal_position: u64, token: u32, hash: u64) -> Self {
        Self {
            journal_position,
            token,
            hash,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Encode into the fixed 20-byte layout.
    pub fn to_bytes(&self) -> [u8; WAYPOINT_LENGTH] {
        let mut out = [0u8; WAYPOINT_LENGTH];
        out[..8].copy_from_slice(&self.journal_position.to_le_bytes());
        out[8..12].copy_from_slice(&self.token.to_le_bytes());
        out[12..].copy_from_slice(&self.hash.to_le_bytes());
        out
    }

    /// Decode from exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> CrystalResult<Self> {
        if bytes.len() != WAYPOINT_LENGTH {
            return Err(CrystalError::CorruptedData(format!(
                "waypoint must be {WAYPOINT_LENGTH} bytes, got {}",
                bytes.len()
            )));
        }
        let mut position = [0u8; 8];
        position.copy_from_slice(&bytes[..8]);
        let mut token = [0u8; 4];
        token.copy_from_slice(&bytes[8..12]);
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&bytes[12..]);
        Ok(Self {
            journal_position: u64::from_le_bytes(position),
            token: u32::from_le_bytes(token),
            hash: u64::from_le_bytes(hash),
        })
    }

    /// Companion path for a snapshot path.
    pub fn companion_path(snapshot_path: &str) -> String {
        format!("{snapshot_path}.{WAYPOINT_EXTENSION}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_little_endian() {
        let wp = Waypoint::new(0x0102, 0x0a0b, 0xff);
        let bytes = wp.to_bytes();
        assert_eq!(bytes.len(), WAYPOINT_LENGTH);
        assert_eq!(&bytes[..2], &[0x02, 0x01]);
        assert_eq!(&bytes[8..10], &[0x0b, 0x0a]);
        assert_eq!(bytes[12], 0xff);
        assert_eq!(Waypoint::from_bytes(&bytes).unwrap(), wp);
    }

    #[test]
    fn wrong_length_is_corrupted() {
        let err = Waypoint::from_bytes(&[0u8; 19]).unwrap_err();
        assert!(matches!(err, CrystalError::CorruptedData(_)));
    }

    #[test]
    fn invalid_is_all_zero() {
        assert!(!Waypoint::INVALID.is_valid());
        assert!(Waypoint::new(0, 0, 1).is_valid());
    }

    #[test]
    fn companion_path_appends_extension() {
        assert_eq!(Waypoint::companion_path("a/root.crystal"), "a/root.crystal.waypoint");
    }
}
