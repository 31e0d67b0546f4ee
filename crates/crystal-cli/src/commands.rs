use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use serde::Serialize;

use crystal::snapshot::{self, SnapshotTarget};
use crystal_filer::LocalFiler;
use crystal_journal::{list_books, plan_recovery, verify_books};
use crystal_storage::{usage_ratio, SimpleStorage, StorageBackend, METADATA_FILE};
use crystal_types::{CrystalError, RegistryConfiguration};

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    match cli.command {
        Command::Verify(args) => {
            let report = verify(&args.snapshot).await?;
            emit(format, &report, print_verify)?;
            if report.status == VerifyStatus::Corrupted {
                bail!("snapshot {} failed verification", report.snapshot);
            }
            Ok(())
        }
        Command::Books(args) => emit(format, &books(&args.directory).await?, print_books),
        Command::Storage(args) => emit(
            format,
            &storage(&args.directory, args.capacity).await?,
            print_storage,
        ),
        Command::Config(args) => {
            let config = RegistryConfiguration::load(&args.file)
                .with_context(|| format!("reading {}", args.file.display()))?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                OutputFormat::Text => {
                    println!("{} {}", "✓".green().bold(), args.file.display().to_string().bold());
                    print!("{}", config.to_toml_string()?);
                }
            }
            Ok(())
        }
    }
}

fn emit<T: Serialize>(format: OutputFormat, report: &T, text: fn(&T)) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => text(report),
    }
    Ok(())
}

// ---- verify ----

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Verified,
    NoWaypoint,
    Corrupted,
}

#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub snapshot: String,
    pub status: VerifyStatus,
    pub size: Option<usize>,
    pub journal_position: Option<u64>,
    pub token: Option<u32>,
    pub hash: Option<String>,
    pub detail: Option<String>,
}

fn split_path(path: &Path) -> anyhow::Result<(PathBuf, String)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} does not name a file", path.display()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((directory, name.to_string()))
}

pub async fn verify(path: &Path) -> anyhow::Result<VerifyReport> {
    let (directory, name) = split_path(path)?;
    let target = SnapshotTarget::new(Arc::new(LocalFiler::new(directory)), name);
    let mut report = VerifyReport {
        snapshot: path.display().to_string(),
        status: VerifyStatus::Verified,
        size: None,
        journal_position: None,
        token: None,
        hash: None,
        detail: None,
    };
    match snapshot::load(&target).await {
        Ok((bytes, waypoint)) => {
            report.size = Some(bytes.len());
            if waypoint.is_valid() {
                report.journal_position = Some(waypoint.journal_position);
                report.token = Some(waypoint.token);
                report.hash = Some(format!("{:016x}", waypoint.hash));
            } else {
                report.status = VerifyStatus::NoWaypoint;
            }
        }
        Err(CrystalError::CorruptedData(detail)) => {
            report.status = VerifyStatus::Corrupted;
            report.detail = Some(detail);
        }
        Err(CrystalError::NoFile) => bail!("snapshot {} not found", path.display()),
        Err(err) => return Err(err.into()),
    }
    Ok(report)
}

fn print_verify(report: &VerifyReport) {
    match report.status {
        VerifyStatus::Verified => {
            println!("{} {}", "✓".green().bold(), report.snapshot.bold());
            println!("  Size: {} bytes", report.size.unwrap_or(0));
            println!("  Hash: {}", report.hash.as_deref().unwrap_or("-").cyan());
            println!(
                "  Journal position: {} (token {})",
                report.journal_position.unwrap_or(0),
                report.token.unwrap_or(0)
            );
        }
        VerifyStatus::NoWaypoint => {
            println!("{} {}", "?".yellow().bold(), report.snapshot.bold());
            println!("  Size: {} bytes", report.size.unwrap_or(0));
            println!("  {}", "no waypoint, hash not checked".yellow());
        }
        VerifyStatus::Corrupted => {
            println!("{} {}", "✗".red().bold(), report.snapshot.bold());
            println!("  {}", report.detail.as_deref().unwrap_or("corrupted").red());
        }
    }
}

// ---- books ----

#[derive(Debug, Serialize)]
pub struct BookEntry {
    pub file: String,
    pub position: u64,
    pub end: u64,
    pub state: &'static str,
    pub hash: String,
    /// Whether the file matches the length and hash in its name.
    pub intact: bool,
    /// Whether journal recovery would keep this book.
    pub kept: bool,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct BookGap {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Serialize)]
pub struct BooksReport {
    pub directory: String,
    pub books: Vec<BookEntry>,
    pub gaps: Vec<BookGap>,
    /// Position appends would resume from after recovery.
    pub position: u64,
}

pub async fn books(directory: &Path) -> anyhow::Result<BooksReport> {
    let filer = LocalFiler::new(directory);
    let listed = list_books(&filer).await?;
    let (intact, _) = verify_books(&filer, listed.clone()).await?;

    let mut gaps = Vec::new();
    let mut covered: Option<u64> = None;
    for book in &intact {
        if let Some(end) = covered {
            if book.position > end {
                gaps.push(BookGap {
                    from: end,
                    to: book.position,
                });
            }
        }
        covered = Some(covered.map_or(book.end(), |end| end.max(book.end())));
    }

    let (kept, _) = plan_recovery(intact.clone());
    let position = kept.last().map(|b| b.end()).unwrap_or(0);
    let books = listed
        .iter()
        .map(|book| BookEntry {
            file: book.path.clone().unwrap_or_else(|| book.file_name()),
            position: book.position,
            end: book.end(),
            state: book.state.suffix(),
            hash: format!("{:016x}", book.hash),
            intact: intact.iter().any(|i| i.path == book.path),
            kept: kept.iter().any(|k| k.path == book.path),
        })
        .collect();

    Ok(BooksReport {
        directory: directory.display().to_string(),
        books,
        gaps,
        position,
    })
}

fn print_books(report: &BooksReport) {
    if report.books.is_empty() {
        println!("No journal books in {}.", report.directory.bold());
        return;
    }
    for book in &report.books {
        let marker = if book.kept { "✓".green() } else { "✗".red() };
        println!(
            "{} [{}, {}) {} {}{}",
            marker,
            book.position,
            book.end,
            book.state.cyan(),
            book.hash.dimmed(),
            if book.intact { "".normal() } else { " damaged".red().bold() }
        );
    }
    for gap in &report.gaps {
        println!("  {} [{}, {})", "gap".red().bold(), gap.from, gap.to);
    }
    println!("Resume position: {}", report.position.to_string().bold());
}

// ---- storage ----

#[derive(Debug, Serialize)]
pub struct StorageReport {
    pub directory: String,
    /// False when usage was rebuilt from a listing.
    pub metadata: bool,
    pub files: usize,
    pub used: u64,
    pub capacity: u64,
    pub ratio: f64,
}

pub async fn storage(directory: &Path, capacity: u64) -> anyhow::Result<StorageReport> {
    if !directory.is_dir() {
        bail!("{} is not a directory", directory.display());
    }
    let backend = SimpleStorage::new(Arc::new(LocalFiler::new(directory)));
    backend.prepare().await?;
    let used = backend.used_bytes();
    Ok(StorageReport {
        directory: directory.display().to_string(),
        metadata: directory.join(METADATA_FILE).exists(),
        files: backend.file_count(),
        used,
        capacity,
        ratio: usage_ratio(used, capacity),
    })
}

fn print_storage(report: &StorageReport) {
    println!("Storage {}", report.directory.bold());
    println!("  Blobs: {}", report.files.to_string().bold());
    println!("  Used: {} bytes", report.used);
    if report.capacity > 0 {
        println!(
            "  Capacity: {} bytes ({:.1}% used)",
            report.capacity,
            report.ratio * 100.0
        );
    }
    if !report.metadata {
        println!("  {}", "metadata missing, usage rebuilt from listing".yellow());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crystal_journal::{book_file_name, BookState, JournalBook};
    use crystal_types::FileId;

    #[tokio::test]
    async fn verify_reports_each_status() {
        let dir = tempfile::tempdir().unwrap();
        let target = SnapshotTarget::new(Arc::new(LocalFiler::new(dir.path())), "root.bin");
        snapshot::save(Bytes::from_static(b"state"), &target, None, None)
            .await
            .unwrap();

        let path = dir.path().join("root.bin");
        let report = verify(&path).await.unwrap();
        assert_eq!(report.status, VerifyStatus::Verified);
        assert_eq!(report.size, Some(5));

        std::fs::write(&path, b"stale").unwrap();
        let report = verify(&path).await.unwrap();
        assert_eq!(report.status, VerifyStatus::Corrupted);

        std::fs::remove_file(dir.path().join("root.bin.waypoint")).unwrap();
        let report = verify(&path).await.unwrap();
        assert_eq!(report.status, VerifyStatus::NoWaypoint);

        assert!(verify(&dir.path().join("absent.bin")).await.is_err());
    }

    #[tokio::test]
    async fn books_report_gap() {
        let dir = tempfile::tempdir().unwrap();
        for position in [0u64, 10, 30] {
            let book = JournalBook::in_memory(position, Bytes::from(vec![position as u8; 10]), true);
            std::fs::write(dir.path().join(book.file_name()), [position as u8; 10]).unwrap();
        }

        let report = books(dir.path()).await.unwrap();
        assert_eq!(report.books.len(), 3);
        assert_eq!(report.gaps, vec![BookGap { from: 20, to: 30 }]);
        assert_eq!(report.position, 40);
        let kept: Vec<u64> = report.books.iter().filter(|b| b.kept).map(|b| b.position).collect();
        assert_eq!(kept, vec![30]);
        assert!(report.books.iter().all(|b| b.intact));
    }

    #[tokio::test]
    async fn books_report_damaged_book() {
        let dir = tempfile::tempdir().unwrap();
        let book = JournalBook::in_memory(0, Bytes::from_static(b"0123456789"), true);
        std::fs::write(dir.path().join(book.file_name()), b"0123456789").unwrap();
        let torn = book_file_name(10, 0x5eed, BookState::Finished);
        std::fs::write(dir.path().join(&torn), b"01234").unwrap();

        let report = books(dir.path()).await.unwrap();
        assert_eq!(report.books.len(), 2);
        let damaged = report.books.iter().find(|b| b.file == torn).unwrap();
        assert!(!damaged.intact);
        assert!(!damaged.kept);
        assert!(report.gaps.is_empty());
        assert_eq!(report.position, 10);
    }

    #[tokio::test]
    async fn storage_counts_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimpleStorage::new(Arc::new(LocalFiler::new(dir.path())));
        backend.prepare().await.unwrap();
        backend
            .put(FileId::NONE, Bytes::from_static(b"abcd"))
            .await
            .unwrap();
        backend
            .put(FileId::NONE, Bytes::from_static(b"efghij"))
            .await
            .unwrap();
        backend.save().await.unwrap();

        let report = storage(dir.path(), 20).await.unwrap();
        assert!(report.metadata);
        assert_eq!(report.files, 2);
        assert_eq!(report.used, 10);
        assert!((report.ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn split_bare_file_name() {
        let (directory, name) = split_path(Path::new("root.bin")).unwrap();
        assert_eq!(directory, PathBuf::from("."));
        assert_eq!(name, "root.bin");
    }
}
