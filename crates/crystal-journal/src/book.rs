use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;

use crystal_checksum::ContentHasher;

const FINISHED_SUFFIX: &str = "finished";
const UNFINISHED_SUFFIX: &str = "unfinished";

/// Persistence state of a book.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BookState {
    /// In memory, or persisted as a partial flush awaiting merge.
    Unfinished,
    /// Persisted and complete.
    Finished,
}

impl BookState {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Unfinished => UNFINISHED_SUFFIX,
            Self::Finished => FINISHED_SUFFIX,
        }
    }
}

/// File name of a book: base64url of `position LE ‖ hash LE`, then the state.
pub fn book_file_name(position: u64, hash: u64, state: BookState) -> String {
    let mut raw = [0u8; 16];
    raw[..8].copy_from_slice(&position.to_le_bytes());
    raw[8..].copy_from_slice(&hash.to_le_bytes());
    format!("{}.{}", URL_SAFE_NO_PAD.encode(raw), state.suffix())
}

/// Inverse of [`book_file_name`]. Returns `(position, hash, state)`.
pub fn parse_book_file_name(name: &str) -> Option<(u64, u64, BookState)> {
    let (stem, suffix) = name.rsplit_once('.')?;
    let state = match suffix {
        FINISHED_SUFFIX => BookState::Finished,
        UNFINISHED_SUFFIX => BookState::Unfinished,
        _ => return None,
    };
    let raw = URL_SAFE_NO_PAD.decode(stem).ok()?;
    if raw.len() != 16 {
        return None;
    }
    let mut position = [0u8; 8];
    let mut hash = [0u8; 8];
    position.copy_from_slice(&raw[..8]);
    hash.copy_from_slice(&raw[8..]);
    Some((u64::from_le_bytes(position), u64::from_le_bytes(hash), state))
}

/// A contiguous, immutable range of journal bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalBook {
    pub position: u64,
    pub length: u32,
    pub state: BookState,
    pub hash: u64,
    /// Whether the book will be persisted as finished.
    pub complete: bool,
    /// Whether the current bytes have been durably written.
    pub saved: bool,
    /// In-memory bytes; released once saved.
    pub bytes: Option<Bytes>,
    /// File name once persisted.
    pub path: Option<String>,
}

impl JournalBook {
    /// A freshly spilled book that has not been written yet.
    pub fn in_memory(position: u64, bytes: Bytes, complete: bool) -> Self {
        Self {
            position,
            length: bytes.len() as u32,
            state: BookState::Unfinished,
            hash: ContentHasher::BOOK.hash64(&bytes),
            complete,
            saved: false,
            bytes: Some(bytes),
            path: None,
        }
    }

    /// A book reconstructed from its file name and size.
    pub fn on_disk(name: &str, size: u64) -> Option<Self> {
        let (position, hash, state) = parse_book_file_name(name)?;
        Some(Self {
            position,
            length: u32::try_from(size).ok()?,
            state,
            hash,
            complete: state == BookState::Finished,
            saved: true,
            bytes: None,
            path: Some(name.to_string()),
        })
    }

    /// Absolute position one past the last byte.
    pub fn end(&self) -> u64 {
        self.position + u64::from(self.length)
    }

    /// State the book takes once written.
    pub fn target_state(&self) -> BookState {
        if self.complete {
            BookState::Finished
        } else {
            BookState::Unfinished
        }
    }

    /// File name under which the book is (or will be) written.
    pub fn file_name(&self) -> String {
        book_file_name(self.position, self.hash, self.target_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn spilled_book_is_unsaved() {
        let book = JournalBook::in_memory(40, Bytes::from_static(b"0123456789"), true);
        assert_eq!(book.end(), 50);
        assert!(!book.saved);
        assert_eq!(book.state, BookState::Unfinished);
        assert!(book.file_name().ends_with(".finished"));
    }

    #[test]
    fn on_disk_book_from_name() {
        let name = book_file_name(10, 77, BookState::Unfinished);
        let book = JournalBook::on_disk(&name, 5).unwrap();
        assert_eq!(book.position, 10);
        assert_eq!(book.hash, 77);
        assert_eq!(book.end(), 15);
        assert!(book.saved);
        assert!(!book.complete);
    }

    #[test]
    fn foreign_names_are_ignored() {
        assert!(parse_book_file_name("storage.meta").is_none());
        assert!(parse_book_file_name("abc.finished").is_none());
        assert!(parse_book_file_name("noext").is_none());
    }

    proptest! {
        #[test]
        fn file_name_parses_back(position in any::<u64>(), hash in any::<u64>(), finished in any::<bool>()) {
            let state = if finished { BookState::Finished } else { BookState::Unfinished };
            let name = book_file_name(position, hash, state);
            prop_assert_eq!(parse_book_file_name(&name), Some((position, hash, state)));
        }
    }
}
