use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crystal_checksum::ContentHasher;
use crystal_filer::RawFiler;
use crystal_types::{BufferPool, CrystalError, CrystalResult, JournalConfiguration};

use crate::book::{book_file_name, BookState, JournalBook};
use crate::record::{parse_records, JournalRecord, JournalRecordType, JournalWriter, MAX_U24};

/// Unfinished books the background loop lets accumulate before merging them.
const COMPACT_RUN: usize = 16;

/// Initial capacity of pooled record writers.
const WRITER_CAPACITY: usize = 256;
const WRITERS_RETAINED: usize = 64;

/// List the book files under `filer`, sorted by position and, for equal
/// positions, longest first.
pub async fn list_books(filer: &dyn RawFiler) -> CrystalResult<Vec<JournalBook>> {
    let mut books: Vec<JournalBook> = filer
        .list("")
        .await?
        .into_iter()
        .filter_map(|entry| JournalBook::on_disk(&entry.path, entry.size))
        .collect();
    books.sort_by(|a, b| a.position.cmp(&b.position).then(b.length.cmp(&a.length)));
    Ok(books)
}

/// Split listed books into those whose file matches the length and hash in
/// its name and those that do not. A torn write fails the check.
pub async fn verify_books(
    filer: &dyn RawFiler,
    books: Vec<JournalBook>,
) -> CrystalResult<(Vec<JournalBook>, Vec<JournalBook>)> {
    let mut intact = Vec::with_capacity(books.len());
    let mut damaged = Vec::new();
    for book in books {
        let Some(path) = book.path.as_deref() else {
            intact.push(book);
            continue;
        };
        let matches = match filer.read(path).await {
            Ok(bytes) => {
                bytes.len() == book.length as usize && ContentHasher::BOOK.verify(&bytes, book.hash)
            }
            Err(CrystalError::NoFile) => false,
            Err(err) => return Err(err),
        };
        if matches {
            intact.push(book);
        } else {
            warn!(path = %path, position = book.position, "journal book does not match its hash");
            damaged.push(book);
        }
    }
    Ok((intact, damaged))
}

/// Split sorted books into the gapless run to keep and the books to delete.
///
/// A book fully covered by the book before it (a merge interrupted before
/// its originals were deleted) is discarded. A break in contiguity discards
/// every book before the break.
pub fn plan_recovery(books: Vec<JournalBook>) -> (Vec<JournalBook>, Vec<JournalBook>) {
    let mut kept: Vec<JournalBook> = Vec::new();
    let mut discarded = Vec::new();
    for book in books {
        if let Some(last) = kept.last() {
            if book.end() <= last.end() {
                discarded.push(book);
                continue;
            }
            if book.position != last.end() {
                warn!(
                    expected = last.end(),
                    found = book.position,
                    dropped = kept.len(),
                    "gap in journal books"
                );
                discarded.append(&mut kept);
            }
        }
        kept.push(book);
    }
    (kept, discarded)
}

#[derive(Debug)]
struct TemporaryBuffer {
    bytes: BytesMut,
    /// Absolute position of the first byte in `bytes`.
    start: u64,
}

#[derive(Debug)]
struct Background {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Append-only journal with periodic book persistence.
///
/// Two locks guard the in-memory state: one for the temporary buffer and one
/// for the book index, always taken in that order. A third, async lock
/// serializes persistence, merging and reads of persisted books.
#[derive(Debug)]
pub struct Journal {
    config: JournalConfiguration,
    filer: Arc<dyn RawFiler>,
    buffer: Mutex<TemporaryBuffer>,
    books: Mutex<BTreeMap<u64, JournalBook>>,
    writers: BufferPool,
    persist_lock: tokio::sync::Mutex<()>,
    background: Mutex<Option<Background>>,
}

impl Journal {
    pub fn new(config: JournalConfiguration, filer: Arc<dyn RawFiler>) -> Self {
        let capacity = config.book_size;
        Self {
            config,
            filer,
            buffer: Mutex::new(TemporaryBuffer {
                bytes: BytesMut::with_capacity(capacity),
                start: 0,
            }),
            books: Mutex::new(BTreeMap::new()),
            writers: BufferPool::new(WRITER_CAPACITY, WRITERS_RETAINED),
            persist_lock: tokio::sync::Mutex::new(()),
            background: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &JournalConfiguration {
        &self.config
    }

    pub fn filer(&self) -> &Arc<dyn RawFiler> {
        &self.filer
    }

    /// Absolute position one past the last appended byte.
    pub fn position(&self) -> u64 {
        let buffer = self.buffer.lock().expect("journal buffer lock poisoned");
        buffer.start + buffer.bytes.len() as u64
    }

    /// Snapshot of the book index.
    pub fn books(&self) -> Vec<JournalBook> {
        self.books
            .lock()
            .expect("journal books lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Rebuild the book index from the book files, discarding books that
    /// fail their hash and books before any gap, and continue appending
    /// after the newest book.
    pub async fn prepare(&self) -> CrystalResult<()> {
        let _guard = self.persist_lock.lock().await;
        let listed = list_books(self.filer.as_ref()).await?;
        let (intact, damaged) = verify_books(self.filer.as_ref(), listed).await?;
        let (kept, mut discarded) = plan_recovery(intact);
        discarded.extend(damaged);

        for book in &discarded {
            if let Some(path) = &book.path {
                match self.filer.delete(path).await {
                    Ok(()) | Err(CrystalError::NoFile) => {}
                    Err(err) => warn!(path = %path, error = %err, "failed to delete stale book"),
                }
            }
        }

        let end = kept.last().map(JournalBook::end).unwrap_or(0);
        {
            let mut buffer = self.buffer.lock().expect("journal buffer lock poisoned");
            let mut books = self.books.lock().expect("journal books lock poisoned");
            buffer.bytes.clear();
            buffer.start = end;
            *books = kept.into_iter().map(|b| (b.position, b)).collect();
        }
        info!(
            filer = %self.filer.describe(),
            position = end,
            discarded = discarded.len(),
            "journal prepared"
        );
        Ok(())
    }

    /// Scratch buffer for a new record of `record_type` tagged with `token`.
    pub fn get_writer(&self, record_type: JournalRecordType, token: u32) -> JournalWriter {
        JournalWriter::new(self.writers.take(), record_type, token)
    }

    /// Append a finished record. Returns the absolute position at which the
    /// record ends.
    pub fn add(&self, writer: JournalWriter) -> CrystalResult<u64> {
        let record = writer.finish();
        let size = record.len();
        let limit = self.config.max_record_length.min(MAX_U24 + 3);
        if size > limit {
            error!(size, limit, "journal record exceeds maximum length");
            self.writers.give(record);
            return Err(CrystalError::OverSizeLimit { size, limit });
        }

        let end = {
            let mut buffer = self.buffer.lock().expect("journal buffer lock poisoned");
            if !buffer.bytes.is_empty()
                && buffer.bytes.len() + self.config.max_record_length > self.config.book_size
            {
                self.spill(&mut buffer, true);
            }
            buffer.bytes.extend_from_slice(&record);
            buffer.start + buffer.bytes.len() as u64
        };
        self.writers.give(record);
        Ok(end)
    }

    /// Move the temporary buffer into a new in-memory book.
    fn spill(&self, buffer: &mut TemporaryBuffer, complete: bool) {
        let fresh = BytesMut::with_capacity(self.config.book_size);
        let bytes = std::mem::replace(&mut buffer.bytes, fresh).freeze();
        let book = JournalBook::in_memory(buffer.start, bytes, complete);
        buffer.start = book.end();
        debug!(position = book.position, length = book.length, complete, "journal book spilled");
        self.books
            .lock()
            .expect("journal books lock poisoned")
            .insert(book.position, book);
    }

    /// One iteration of the persistence loop: flush the temporary buffer,
    /// then write unsaved books in position order.
    pub async fn persist(&self) -> CrystalResult<()> {
        let _guard = self.persist_lock.lock().await;
        {
            let mut buffer = self.buffer.lock().expect("journal buffer lock poisoned");
            if !buffer.bytes.is_empty() {
                self.spill(&mut buffer, false);
            }
        }

        let pending: Vec<(u64, String, Bytes, BookState)> = self
            .books
            .lock()
            .expect("journal books lock poisoned")
            .values()
            .filter(|book| !book.saved)
            .filter_map(|book| {
                book.bytes
                    .clone()
                    .map(|bytes| (book.position, book.file_name(), bytes, book.target_state()))
            })
            .collect();

        for (position, name, bytes, state) in pending {
            let len = bytes.len();
            if let Err(err) = self.filer.write(&name, bytes).await {
                warn!(position, error = %err, "failed to write journal book");
                return Err(err);
            }
            let mut books = self.books.lock().expect("journal books lock poisoned");
            if let Some(book) = books.get_mut(&position) {
                book.saved = true;
                book.state = state;
                book.bytes = None;
                book.path = Some(name);
            }
            debug!(position, len, "journal book saved");
        }
        Ok(())
    }

    /// Bytes of a book, from memory or from its file. Persisted bytes are
    /// checked against the hash in the book's name.
    async fn load_book(&self, book: &JournalBook) -> CrystalResult<Bytes> {
        if let Some(bytes) = &book.bytes {
            return Ok(bytes.clone());
        }
        let path = book.path.as_deref().ok_or(CrystalError::NoData)?;
        let bytes = self.filer.read(path).await?;
        if bytes.len() != book.length as usize || !ContentHasher::BOOK.verify(&bytes, book.hash) {
            return Err(CrystalError::CorruptedData(format!(
                "journal book {path} does not match its hash"
            )));
        }
        Ok(bytes)
    }

    /// Replace the books covering exactly `[start, end)` with one finished
    /// book holding `bytes`.
    ///
    /// The merged book is written first. If the retained books do not start
    /// at `start` and end at `end` contiguously, the new file is removed and
    /// `NotFound` is returned.
    pub async fn merge_books(&self, start: u64, end: u64, bytes: Bytes) -> CrystalResult<()> {
        let _guard = self.persist_lock.lock().await;
        self.merge_locked(start, end, bytes).await
    }

    async fn merge_locked(&self, start: u64, end: u64, bytes: Bytes) -> CrystalResult<()> {
        if end <= start || bytes.len() as u64 != end - start {
            return Err(CrystalError::CorruptedData(format!(
                "merged book of {} bytes cannot cover [{start}, {end})",
                bytes.len()
            )));
        }
        let hash = ContentHasher::BOOK.hash64(&bytes);
        let name = book_file_name(start, hash, BookState::Finished);
        let already_present = self
            .books
            .lock()
            .expect("journal books lock poisoned")
            .values()
            .any(|book| book.path.as_deref() == Some(name.as_str()));
        if already_present {
            return Ok(());
        }

        self.filer.write(&name, bytes.clone()).await?;

        let replaced = {
            let mut books = self.books.lock().expect("journal books lock poisoned");
            let range: Vec<&JournalBook> = books.range(start..end).map(|(_, b)| b).collect();
            let exact = range.first().is_some_and(|b| b.position == start)
                && range.last().is_some_and(|b| b.end() == end)
                && range.windows(2).all(|w| w[0].end() == w[1].position)
                && range.iter().all(|b| b.saved);
            if exact {
                let positions: Vec<u64> = range.iter().map(|b| b.position).collect();
                let old: Vec<JournalBook> = positions
                    .into_iter()
                    .filter_map(|p| books.remove(&p))
                    .collect();
                books.insert(
                    start,
                    JournalBook {
                        position: start,
                        length: bytes.len() as u32,
                        state: BookState::Finished,
                        hash,
                        complete: true,
                        saved: true,
                        bytes: None,
                        path: Some(name.clone()),
                    },
                );
                Some(old)
            } else {
                None
            }
        };

        let Some(old) = replaced else {
            if let Err(err) = self.filer.delete(&name).await {
                warn!(path = %name, error = %err, "failed to remove rejected merge");
            }
            return Err(CrystalError::NotFound);
        };

        for book in &old {
            if let Some(path) = &book.path {
                match self.filer.delete(path).await {
                    Ok(()) | Err(CrystalError::NoFile) => {}
                    Err(err) => warn!(path = %path, error = %err, "failed to delete merged book"),
                }
            }
        }
        info!(start, end, merged = old.len(), "journal books merged");
        Ok(())
    }

    /// Merge every run of at least `min_run` contiguous saved unfinished
    /// books. Returns the number of merges performed.
    async fn compact_runs(&self, min_run: usize) -> CrystalResult<usize> {
        let runs: Vec<Vec<JournalBook>> = {
            let books = self.books.lock().expect("journal books lock poisoned");
            let mut runs = Vec::new();
            let mut run: Vec<JournalBook> = Vec::new();
            for book in books.values() {
                let mergeable = book.saved && book.state == BookState::Unfinished;
                let contiguous = run.last().map_or(true, |last| last.end() == book.position);
                if !mergeable || !contiguous {
                    runs.push(std::mem::take(&mut run));
                }
                if mergeable {
                    run.push(book.clone());
                }
            }
            runs.push(run);
            runs.into_iter().filter(|r| r.len() >= min_run).collect()
        };

        let mut merged = 0;
        for run in runs {
            let (Some(first), Some(last)) = (run.first(), run.last()) else {
                continue;
            };
            let (start, end) = (first.position, last.end());
            let mut bytes = BytesMut::with_capacity((end - start) as usize);
            for book in &run {
                bytes.extend_from_slice(&self.load_book(book).await?);
            }
            self.merge_locked(start, end, bytes.freeze()).await?;
            merged += 1;
        }
        Ok(merged)
    }

    /// Merge runs of saved partial books into finished books.
    pub async fn compact(&self) -> CrystalResult<usize> {
        let _guard = self.persist_lock.lock().await;
        self.compact_runs(2).await
    }

    /// Every record ending after `from`, oldest first.
    pub async fn read_records(&self, from: u64) -> CrystalResult<Vec<JournalRecord>> {
        let _guard = self.persist_lock.lock().await;
        let (books, tail_start, tail) = {
            let buffer = self.buffer.lock().expect("journal buffer lock poisoned");
            let books = self.books.lock().expect("journal books lock poisoned");
            let selected: Vec<JournalBook> =
                books.values().filter(|b| b.end() > from).cloned().collect();
            (selected, buffer.start, Bytes::copy_from_slice(&buffer.bytes))
        };

        let mut records = Vec::new();
        for book in &books {
            let bytes = self.load_book(book).await?;
            records.extend(
                parse_records(book.position, &bytes)?
                    .into_iter()
                    .filter(|r| r.end > from),
            );
        }
        records.extend(
            parse_records(tail_start, &tail)?
                .into_iter()
                .filter(|r| r.end > from),
        );
        Ok(records)
    }

    /// Spawn the periodic persistence loop. Does nothing if already running.
    pub fn start(self: &Arc<Self>) {
        let mut background = self.background.lock().expect("journal task lock poisoned");
        if background.is_some() {
            return;
        }
        let (shutdown, mut stopped) = watch::channel(false);
        let journal = Arc::clone(self);
        let period = Duration::from_millis(self.config.persist_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = journal.persist().await {
                            warn!(error = %err, "journal persist failed");
                            continue;
                        }
                        let _guard = journal.persist_lock.lock().await;
                        if let Err(err) = journal.compact_runs(COMPACT_RUN).await {
                            warn!(error = %err, "journal compaction failed");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            debug!("journal loop stopped");
        });
        *background = Some(Background { shutdown, handle });
        info!(interval_ms = period.as_millis() as u64, "journal loop started");
    }

    /// Stop the loop after its current iteration, then persist and compact
    /// once more.
    pub async fn terminate(&self) -> CrystalResult<()> {
        let background = self
            .background
            .lock()
            .expect("journal task lock poisoned")
            .take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            if let Err(err) = background.handle.await {
                warn!(error = %err, "journal loop ended abnormally");
            }
        }
        self.persist().await?;
        self.compact().await?;
        info!(position = self.position(), "journal terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crystal_filer::LocalFiler;
    use crystal_types::FilerConfiguration;

    fn journal(dir: &tempfile::TempDir, book_size: usize, max_record_length: usize) -> Journal {
        let config = JournalConfiguration {
            directory: FilerConfiguration::local(dir.path()),
            max_record_length,
            book_size,
            persist_interval_ms: 10,
        };
        Journal::new(config, Arc::new(LocalFiler::new(dir.path())))
    }

    fn add_value(journal: &Journal, token: u32, value: u64) -> u64 {
        let mut writer = journal.get_writer(JournalRecordType::Value, token);
        writer.put_u64_le(value);
        journal.add(writer).unwrap()
    }

    async fn file_names(journal: &Journal) -> Vec<String> {
        journal
            .filer()
            .list("")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect()
    }

    #[tokio::test]
    async fn positions_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir, 64, 32);
        journal.prepare().await.unwrap();

        let mut last = 0;
        for i in 0..100 {
            let end = add_value(&journal, 1, i);
            assert!(end > last);
            last = end;
        }
        assert_eq!(journal.position(), last);
        assert_eq!(last, 100 * 16);
    }

    #[tokio::test]
    async fn oversize_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir, 1024, 32);
        let mut writer = journal.get_writer(JournalRecordType::Value, 0);
        writer.put_slice(&[0u8; 40]);
        let err = journal.add(writer).unwrap_err();
        assert_eq!(err, CrystalError::OverSizeLimit { size: 48, limit: 32 });
        assert_eq!(journal.position(), 0);
    }

    #[tokio::test]
    async fn buffer_spills_into_book_before_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir, 64, 32);
        for i in 0..4 {
            add_value(&journal, 0, i);
        }
        let books = journal.books();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].position, 0);
        assert_eq!(books[0].length, 48);
        assert!(books[0].complete);
        assert!(!books[0].saved);
    }

    #[tokio::test]
    async fn persist_then_reopen_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let first = journal(&dir, 64, 32);
        first.prepare().await.unwrap();
        for i in 0..10 {
            add_value(&first, i as u32, i);
        }
        first.persist().await.unwrap();
        assert!(first.books().iter().all(|b| b.saved && b.bytes.is_none()));
        let end = first.position();

        let second = journal(&dir, 64, 32);
        second.prepare().await.unwrap();
        assert_eq!(second.position(), end);

        let records = second.read_records(0).await.unwrap();
        assert_eq!(records.len(), 10);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.token, i as u32);
            assert_eq!(record.words().next(), Some(i as u64));
        }
        assert_eq!(records.last().unwrap().end, end);
    }

    #[tokio::test]
    async fn read_records_after_position() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir, 64, 32);
        add_value(&journal, 0, 0);
        let mark = add_value(&journal, 0, 1);
        add_value(&journal, 0, 2);
        add_value(&journal, 0, 3);
        add_value(&journal, 0, 4);

        let records = journal.read_records(mark).await.unwrap();
        let values: Vec<u64> = records.iter().filter_map(|r| r.words().next()).collect();
        assert_eq!(values, vec![2, 3, 4]);
    }

    async fn write_book(
        filer: &Arc<dyn RawFiler>,
        position: u64,
        bytes: Vec<u8>,
        state: BookState,
    ) -> String {
        let name = book_file_name(position, ContentHasher::BOOK.hash64(&bytes), state);
        filer.write(&name, Bytes::from(bytes)).await.unwrap();
        name
    }

    #[tokio::test]
    async fn gap_discards_books_before_it() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir, 64, 32);
        let filer = journal.filer().clone();
        let mut names = Vec::new();
        for position in [0u64, 10, 30] {
            let bytes = vec![position as u8; 10];
            names.push(write_book(&filer, position, bytes, BookState::Finished).await);
        }

        journal.prepare().await.unwrap();
        let books = journal.books();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].position, 30);
        assert_eq!(journal.position(), 40);
        assert_eq!(file_names(&journal).await, vec![names[2].clone()]);
    }

    #[tokio::test]
    async fn interrupted_merge_keeps_merged_book() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir, 64, 32);
        let filer = journal.filer().clone();
        let mut merged = Vec::new();
        for position in [0u64, 10, 20] {
            let bytes = vec![position as u8 + 1; 10];
            merged.extend_from_slice(&bytes);
            write_book(&filer, position, bytes, BookState::Unfinished).await;
        }
        let name = write_book(&filer, 0, merged, BookState::Finished).await;

        journal.prepare().await.unwrap();
        let books = journal.books();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].length, 30);
        assert_eq!(file_names(&journal).await, vec![name]);
    }

    #[tokio::test]
    async fn torn_merge_keeps_original_books() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir, 64, 32);
        let filer = journal.filer().clone();
        let mut merged = Vec::new();
        for position in [0u64, 10, 20] {
            let bytes = vec![position as u8 + 1; 10];
            merged.extend_from_slice(&bytes);
            write_book(&filer, position, bytes, BookState::Unfinished).await;
        }
        let torn = book_file_name(0, ContentHasher::BOOK.hash64(&merged), BookState::Finished);
        filer
            .write(&torn, Bytes::copy_from_slice(&merged[..25]))
            .await
            .unwrap();

        journal.prepare().await.unwrap();
        let positions: Vec<u64> = journal.books().iter().map(|b| b.position).collect();
        assert_eq!(positions, vec![0, 10, 20]);
        assert_eq!(journal.position(), 30);
        let names = file_names(&journal).await;
        assert_eq!(names.len(), 3);
        assert!(!names.contains(&torn));
    }

    #[tokio::test]
    async fn merge_requires_exact_range() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir, 1024, 32);
        journal.prepare().await.unwrap();
        add_value(&journal, 0, 1);
        journal.persist().await.unwrap();
        add_value(&journal, 0, 2);
        journal.persist().await.unwrap();
        let end = journal.position();
        assert_eq!(file_names(&journal).await.len(), 2);

        let err = journal
            .merge_books(1, end, Bytes::from(vec![0u8; (end - 1) as usize]))
            .await
            .unwrap_err();
        assert_eq!(err, CrystalError::NotFound);
        assert_eq!(file_names(&journal).await.len(), 2);
        assert_eq!(journal.books().len(), 2);
    }

    #[tokio::test]
    async fn terminate_compacts_partial_books() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal(&dir, 1024, 32);
        journal.prepare().await.unwrap();
        add_value(&journal, 0, 1);
        journal.persist().await.unwrap();
        add_value(&journal, 0, 2);
        journal.terminate().await.unwrap();

        let names = file_names(&journal).await;
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".finished"));

        let values: Vec<u64> = journal
            .read_records(0)
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.words().next())
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn tampered_book_is_dropped_on_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let first = journal(&dir, 1024, 32);
        add_value(&first, 0, 7);
        first.persist().await.unwrap();
        let name = file_names(&first).await.remove(0);
        let mut bytes = first.filer().read(&name).await.unwrap().to_vec();
        bytes[10] ^= 0xff;
        first.filer().write(&name, Bytes::from(bytes)).await.unwrap();

        let second = journal(&dir, 1024, 32);
        second.prepare().await.unwrap();
        assert!(second.books().is_empty());
        assert_eq!(second.position(), 0);
        assert!(file_names(&second).await.is_empty());
    }

    #[tokio::test]
    async fn book_changed_after_prepare_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let first = journal(&dir, 1024, 32);
        add_value(&first, 0, 7);
        first.persist().await.unwrap();

        let second = journal(&dir, 1024, 32);
        second.prepare().await.unwrap();
        let name = file_names(&second).await.remove(0);
        let mut bytes = second.filer().read(&name).await.unwrap().to_vec();
        bytes[10] ^= 0xff;
        second.filer().write(&name, Bytes::from(bytes)).await.unwrap();
        assert!(matches!(
            second.read_records(0).await,
            Err(CrystalError::CorruptedData(_))
        ));
    }

    #[tokio::test]
    async fn background_loop_persists() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(journal(&dir, 1024, 32));
        journal.prepare().await.unwrap();
        journal.start();
        add_value(&journal, 0, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!file_names(&journal).await.is_empty());
        journal.terminate().await.unwrap();
        assert!(journal.books().iter().all(|b| b.saved));
    }
}
