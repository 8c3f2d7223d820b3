//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, the writer side of a sync:
//! rendered pages, collection folders and downloaded attachments all go
//! through it. Every write overwrites in place; there is no transactional
//! guarantee beyond what the underlying store offers.

mod local;
#[cfg(feature = "mock")]
mod mock;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
use crate::error::Result;
use crate::path::validate as validate_path;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Unified interface for output backends.
///
/// # Path Handling
/// All paths are relative to the output root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations should
/// enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use pagesync_storage::{StorageBackend, error::Result};
///
/// async fn publish(backend: &dyn StorageBackend, markdown: &str) -> Result<()> {
///     backend.ensure_folder(Path::new("Tasks")).await?;
///     let written = backend.write_file(Path::new("Tasks"), "Launch plan.md", markdown).await?;
///     assert_eq!(written, Path::new("Tasks/Launch plan.md"));
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend (used for logging only).
    fn name(&self) -> &str;

    /// Check if a file exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Write file contents, creating parent folders as needed and overwriting
    /// any existing file.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Create a folder (and its parents). Succeeds if it already exists.
    async fn ensure_folder(&self, folder: &Path) -> Result<()>;

    /// Delete a file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Write a text document named `name` inside `folder` (which may be empty
    /// for the output root). Returns the validated relative path written.
    async fn write_file(&self, folder: &Path, name: &str, content: &str) -> Result<PathBuf> {
        let path = validate_path(folder.join(name))?;
        self.write(&path, content.as_bytes()).await?;
        Ok(path)
    }

    /// Write a downloaded attachment. Returns the validated relative path
    /// written, which is what gets recorded and linked to.
    async fn write_attachment(&self, path: &Path, data: &[u8]) -> Result<PathBuf> {
        let path = validate_path(path)?;
        self.write(&path, data).await?;
        Ok(path)
    }
}
