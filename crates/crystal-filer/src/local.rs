use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crystal_types::{CrystalError, CrystalResult};

use crate::traits::{FileEntry, RawFiler};

/// Filer rooted at a local directory.
#[derive(Clone, Debug)]
pub struct LocalFiler {
    root: PathBuf,
}

impl LocalFiler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> CrystalResult<PathBuf> {
        if path.split('/').any(|part| part == "..") {
            return Err(CrystalError::Io(format!("path escapes filer root: {path}")));
        }
        Ok(self.root.join(path.trim_start_matches('/')))
    }

    fn collect(&self, dir: &Path, prefix: &str, out: &mut Vec<FileEntry>) -> CrystalResult<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                self.collect(&path, prefix, out)?;
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if relative.starts_with(prefix) {
                out.push(FileEntry {
                    path: relative,
                    size: entry.metadata()?.len(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RawFiler for LocalFiler {
    async fn read(&self, path: &str) -> CrystalResult<Bytes> {
        let full = self.full_path(path)?;
        let data = tokio::fs::read(&full).await?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: Bytes) -> CrystalResult<()> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, &data).await?;
        debug!(path = %full.display(), len = data.len(), "local write");
        Ok(())
    }

    async fn delete(&self, path: &str) -> CrystalResult<()> {
        let full = self.full_path(path)?;
        tokio::fs::remove_file(&full).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> CrystalResult<Vec<FileEntry>> {
        let filer = self.clone();
        let prefix = prefix.to_string();
        let listed = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            filer.collect(&filer.root, &prefix, &mut out).map(|()| out)
        })
        .await
        .map_err(|e| CrystalError::Io(e.to_string()))?;
        let mut entries = listed?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn read_blocking(&self, path: &str) -> CrystalResult<Bytes> {
        let full = self.full_path(path)?;
        Ok(Bytes::from(std::fs::read(full)?))
    }

    fn write_blocking(&self, path: &str, data: Bytes) -> CrystalResult<()> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(full, &data)?;
        Ok(())
    }

    fn delete_blocking(&self, path: &str) -> CrystalResult<()> {
        let full = self.full_path(path)?;
        std::fs::remove_file(full)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_nested() {
        let dir = tempfile::tempdir().unwrap();
        let filer = LocalFiler::new(dir.path());
        filer
            .write("ab/00ab0001", Bytes::from_static(b"nested"))
            .await
            .unwrap();
        assert_eq!(&filer.read("ab/00ab0001").await.unwrap()[..], b"nested");
    }

    #[tokio::test]
    async fn missing_file_is_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let filer = LocalFiler::new(dir.path());
        assert_eq!(filer.read("nope").await.unwrap_err(), CrystalError::NoFile);
        assert_eq!(filer.delete("nope").await.unwrap_err(), CrystalError::NoFile);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let filer = LocalFiler::new(dir.path());
        filer.write("journal/b", Bytes::from_static(b"22")).await.unwrap();
        filer.write("journal/a", Bytes::from_static(b"1")).await.unwrap();
        filer.write("other/c", Bytes::from_static(b"333")).await.unwrap();

        let listed = filer.list("journal/").await.unwrap();
        assert_eq!(
            listed,
            vec![
                FileEntry { path: "journal/a".into(), size: 1 },
                FileEntry { path: "journal/b".into(), size: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn list_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let filer = LocalFiler::new(dir.path().join("absent"));
        assert!(filer.list("").await.unwrap().is_empty());
    }

    #[test]
    fn blocking_roundtrip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let filer = LocalFiler::new(dir.path());
        filer
            .write_blocking("x/y", Bytes::from_static(b"blocking"))
            .unwrap();
        assert_eq!(&filer.read_blocking("x/y").unwrap()[..], b"blocking");
        filer.delete_blocking("x/y").unwrap();
        assert_eq!(filer.read_blocking("x/y").unwrap_err(), CrystalError::NoFile);
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let filer = LocalFiler::new("/tmp/crystal");
        assert!(matches!(
            filer.read_blocking("../etc/passwd"),
            Err(CrystalError::Io(_))
        ));
    }
}
