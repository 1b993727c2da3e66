//! File system abstraction for testability.

use async_trait::async_trait;
use std::path::Path;

use tokio::io::AsyncReadExt;

/// Abstraction over the file system operations the engine performs outside
/// of the external tools: resume-detection scans and content sniffing.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Checks if a file exists at the given path.
    async fn file_exists(&self, path: &Path) -> bool;

    /// Returns the size of a file if it exists.
    async fn file_size(&self, path: &Path) -> Option<u64>;

    /// Reads up to `len` bytes from the start of a file.
    async fn read_prefix(&self, path: &Path, len: usize) -> std::io::Result<Vec<u8>>;

    /// Creates all directories in the given path.
    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;
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
    async fn file_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn file_size(&self, path: &Path) -> Option<u64> {
        tokio::fs::metadata(path)
            .await
            .ok()
            .filter(std::fs::Metadata::is_file)
            .map(|m| m.len())
    }

    async fn read_prefix(&self, path: &Path, len: usize) -> std::io::Result<Vec<u8>> {
        let file = tokio::fs::File::open(path).await?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }
}
