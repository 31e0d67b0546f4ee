//! CRC32-sealed frames for small metadata files.
//!
//! On-disk format:
//! ```text
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crystal_types::{CrystalError, CrystalResult};

const CRC_SIZE: usize = 4;

/// Prefix a payload with its CRC32.
pub fn seal(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(CRC_SIZE + payload.len());
    out.put_u32_le(crc32fast::hash(payload));
    out.put_slice(payload);
    out.freeze()
}

/// Verify and strip the CRC32 prefix.
pub fn open(frame: &[u8]) -> CrystalResult<&[u8]> {
    if frame.len() < CRC_SIZE {
        return Err(CrystalError::CorruptedData(format!(
            "sealed frame too short: {} bytes",
            frame.len()
        )));
    }
    let expected = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let payload = &frame[CRC_SIZE..];
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(CrystalError::CorruptedData(format!(
            "CRC mismatch: expected {expected:#010x}, got {actual:#010x}"
        )));
    }
    Ok(payload)
}

/// Encode a value with bincode and seal it.
pub fn seal_bincode<T: Serialize>(value: &T) -> CrystalResult<Bytes> {
    let payload = bincode::serialize(value).map_err(CrystalError::serialize)?;
    Ok(seal(&payload))
}

/// Open a sealed frame and decode its bincode payload.
pub fn open_bincode<T: DeserializeOwned>(frame: &[u8]) -> CrystalResult<T> {
    let payload = open(frame)?;
    bincode::deserialize(payload).map_err(CrystalError::deserialize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn seal_then_open() {
        let frame = seal(b"metadata");
        assert_eq!(open(&frame).unwrap(), b"metadata");
    }

    #[test]
    fn flipped_payload_is_corrupted() {
        let mut frame = seal(b"metadata").to_vec();
        frame[6] ^= 0x20;
        assert!(matches!(open(&frame), Err(CrystalError::CorruptedData(_))));
    }

    #[test]
    fn short_frame_is_corrupted() {
        assert!(matches!(open(&[1, 2]), Err(CrystalError::CorruptedData(_))));
    }

    #[test]
    fn bincode_map_survives_sealing() {
        let mut map = BTreeMap::new();
        map.insert(7u32, 100u64);
        map.insert(9u32, 5u64);
        let frame = seal_bincode(&map).unwrap();
        let back: BTreeMap<u32, u64> = open_bincode(&frame).unwrap();
        assert_eq!(back, map);
    }
}
