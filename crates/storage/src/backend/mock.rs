//! In-memory storage backend for testing.

use crate::StorageBackend;
use crate::error::{ErrorKind, Result};
use crate::path::validate as validate_path;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// In-memory storage backend for testing.
///
/// Files live in a map behind a [`RwLock`], so all trait methods can operate
/// on `&self`. Writes and deletes are counted, and writes to chosen paths can
/// be made to fail.
///
/// # Examples
///
/// ```
/// use pagesync_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::default();
/// backend.write_file(Path::new("Tasks"), "Plan.md", "# Plan").await?;
/// assert!(backend.exists(Path::new("Tasks/Plan.md")).await?);
/// assert_eq!(backend.write_count(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MockBackend {
    files: RwLock<BTreeMap<PathBuf, Vec<u8>>>,
    folders: RwLock<BTreeSet<PathBuf>>,
    failing: RwLock<BTreeSet<PathBuf>>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
}

impl MockBackend {
    /// Make every write to `path` fail with a permission error.
    ///
    /// Panics on an invalid path: if test setup is wrong, the test should
    /// not pass.
    pub async fn fail_writes_to(&self, path: impl AsRef<Path>) {
        let Ok(validated) = validate_path(path.as_ref()) else {
            panic!("MockBackend::fail_writes_to: invalid path {}", path.as_ref().display());
        };
        self.failing.write().await.insert(validated);
    }

    pub async fn clear_failures(&self) {
        self.failing.write().await.clear();
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of successful deletes so far.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// All stored file paths, sorted.
    pub async fn paths(&self) -> Vec<PathBuf> {
        self.files.read().await.keys().cloned().collect()
    }

    pub async fn folders(&self) -> Vec<PathBuf> {
        self.folders.read().await.iter().cloned().collect()
    }

    /// Contents of a stored file as UTF-8, if present.
    pub async fn text(&self, path: impl AsRef<Path>) -> Option<String> {
        let files = self.files.read().await;
        files.get(path.as_ref()).map(|data| String::from_utf8_lossy(data).into_owned())
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.files.read().await.contains_key(&path))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        if self.failing.read().await.contains(&path) {
            exn::bail!(ErrorKind::PermissionDenied(path));
        }
        self.files.write().await.insert(path, data.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_folder(&self, folder: &Path) -> Result<()> {
        let folder = validate_path(folder)?;
        self.folders.write().await.insert(folder);
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        match self.files.write().await.remove(&path) {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            None => exn::bail!(ErrorKind::NotFound(path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_and_failures() {
        let backend = MockBackend::default();
        backend.write_file(Path::new(""), "a.md", "a").await.unwrap();
        backend.fail_writes_to("b.md").await;
        let err = backend.write_file(Path::new(""), "b.md", "b").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::PermissionDenied(_)));
        assert_eq!(backend.write_count(), 1);

        backend.clear_failures().await;
        backend.write_file(Path::new(""), "b.md", "b").await.unwrap();
        backend.delete(Path::new("a.md")).await.unwrap();
        assert_eq!(backend.paths().await, vec![PathBuf::from("b.md")]);
        assert_eq!(backend.delete_count(), 1);
        assert_eq!(backend.text("b.md").await.as_deref(), Some("b"));
    }
}
