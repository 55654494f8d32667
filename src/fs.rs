//! File system abstraction for testability.

use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

/// A boxed async writer over a `.temp` file.
pub type TempWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The subset of file metadata the manager relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    /// Length in bytes.
    pub len: u64,
    /// Last modification time, if the platform reports one.
    pub modified: Option<SystemTime>,
}

/// Abstraction over file system operations for testability.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Returns metadata for a regular file, or `None` if it does not exist.
    async fn metadata(&self, path: &Path) -> Option<FileMeta>;

    /// Creates all directories in the given path.
    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Opens a file for writing, creating it if needed.
    ///
    /// With `append` the writer continues after the existing bytes, otherwise
    /// the file is truncated first.
    async fn open_write(&self, path: &Path, append: bool) -> std::io::Result<TempWriter>;

    /// Renames `from` to `to`.
    async fn rename_file(&self, from: &Path, to: &Path) -> std::io::Result<()>;

    /// Removes a file.
    async fn remove_file(&self, path: &Path) -> std::io::Result<()>;

    /// Checks if a file exists at the given path.
    async fn file_exists(&self, path: &Path) -> bool {
        self.metadata(path).await.is_some()
    }

    /// Returns the size of a file if it exists.
    async fn file_size(&self, path: &Path) -> Option<u64> {
        self.metadata(path).await.map(|m| m.len)
    }
}

/// Default file system implementation using `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

impl TokioFileSystem {
    /// Creates a new `TokioFileSystem` instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn metadata(&self, path: &Path) -> Option<FileMeta> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(FileMeta {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn open_write(&self, path: &Path, append: bool) -> std::io::Result<TempWriter> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .await?;
        Ok(Box::new(file))
    }

    async fn rename_file(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}
