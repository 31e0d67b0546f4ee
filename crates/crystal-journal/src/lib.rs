//! Append-only journal for Crystal.
//!
//! Records are appended to an in-memory temporary buffer. When the buffer
//! cannot take another maximum-length record it is spilled into an immutable
//! book. A background loop periodically flushes the buffer and writes unsaved
//! books through a [`crystal_filer::RawFiler`]. Book files are named after
//! their start position and content hash, so the retained book list can be
//! reconstructed (and gaps detected) from a directory listing alone.

pub mod book;
pub mod journal;
pub mod record;

pub use book::{book_file_name, parse_book_file_name, BookState, JournalBook};
pub use journal::{list_books, plan_recovery, verify_books, Journal};
pub use record::{parse_records, JournalRecord, JournalRecordType, JournalWriter, RECORD_HEADER_LENGTH};
