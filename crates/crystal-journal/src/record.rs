//! Journal record framing.
//!
//! On-disk format of one record:
//! ```text
//! [3 bytes: length (little-endian u24), covers type + token + payload]
//! [1 byte:  record type]
//! [4 bytes: token (little-endian u32)]
//! [N bytes: payload]
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crystal_types::{CrystalError, CrystalResult};

/// Bytes in front of every payload.
pub const RECORD_HEADER_LENGTH: usize = 8;

const LENGTH_FIELD: usize = 3;
pub(crate) const MAX_U24: usize = 0x00ff_ffff;

/// Kind of a journal record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JournalRecordType {
    /// Snapshot checkpoint: payload is the snapshot hash.
    Check = 1,
    /// Data node created: parent id and child id.
    Create = 2,
    /// Datum slot flushed: node id, datum type id, storage id, file id.
    Locator = 3,
    /// Data node deleted: node id.
    Delete = 4,
    /// Application-defined value.
    Value = 5,
}

impl TryFrom<u8> for JournalRecordType {
    type Error = CrystalError;

    fn try_from(raw: u8) -> CrystalResult<Self> {
        match raw {
            1 => Ok(Self::Check),
            2 => Ok(Self::Create),
            3 => Ok(Self::Locator),
            4 => Ok(Self::Delete),
            5 => Ok(Self::Value),
            other => Err(CrystalError::CorruptedData(format!(
                "unknown journal record type {other}"
            ))),
        }
    }
}

/// Scratch buffer for one record, obtained from [`crate::Journal::get_writer`].
///
/// The header is preloaded; callers append the payload with the `put_*`
/// methods and hand the writer back to [`crate::Journal::add`].
#[derive(Debug)]
pub struct JournalWriter {
    buf: BytesMut,
}

impl JournalWriter {
    pub(crate) fn new(mut buf: BytesMut, record_type: JournalRecordType, token: u32) -> Self {
        buf.clear();
        buf.put_bytes(0, LENGTH_FIELD);
        buf.put_u8(record_type as u8);
        buf.put_u32_le(token);
        Self { buf }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u16_le(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16_le(value);
        self
    }

    pub fn put_u32_le(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn put_u64_le(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    pub fn put_i64_le(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64_le(value);
        self
    }

    pub fn put_slice(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Length of the finished record, header included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == RECORD_HEADER_LENGTH
    }

    /// Back-patch the length field and release the buffer.
    pub(crate) fn finish(mut self) -> BytesMut {
        let length = (self.buf.len() - LENGTH_FIELD).min(MAX_U24) as u32;
        self.buf[..LENGTH_FIELD].copy_from_slice(&length.to_le_bytes()[..LENGTH_FIELD]);
        self.buf
    }
}

/// A parsed record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalRecord {
    /// Absolute journal position at which the record ends.
    pub end: u64,
    pub record_type: JournalRecordType,
    pub token: u32,
    pub payload: Bytes,
}

impl JournalRecord {
    /// Split the payload into little-endian `u64` words. Trailing bytes that
    /// do not fill a word are ignored.
    pub fn words(&self) -> impl Iterator<Item = u64> + '_ {
        self.payload.chunks_exact(8).map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
    }
}

/// Parse every record in `bytes`, which start at absolute position `start`.
pub fn parse_records(start: u64, bytes: &Bytes) -> CrystalResult<Vec<JournalRecord>> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if offset + RECORD_HEADER_LENGTH > bytes.len() {
            return Err(CrystalError::CorruptedData(format!(
                "truncated record header at position {}",
                start + offset as u64
            )));
        }
        let length = u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], 0])
            as usize;
        let total = LENGTH_FIELD + length;
        if total < RECORD_HEADER_LENGTH || offset + total > bytes.len() {
            return Err(CrystalError::CorruptedData(format!(
                "invalid record length {length} at position {}",
                start + offset as u64
            )));
        }
        let record_type = JournalRecordType::try_from(bytes[offset + LENGTH_FIELD])?;
        let token = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]);
        let payload = bytes.slice(offset + RECORD_HEADER_LENGTH..offset + total);
        offset += total;
        records.push(JournalRecord {
            end: start + offset as u64,
            record_type,
            token,
            payload,
        });
    }
    Ok(records)
}
