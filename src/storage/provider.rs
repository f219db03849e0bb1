use async_trait::async_trait;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;

use crate::error::Result;

/// Streaming reader over stored blob bytes
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Physical byte storage, addressed by provider-relative paths
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Move a completed local file into storage at `path`.
    /// The file at `path` must either be absent or complete afterwards, never partial.
    async fn put_file(&self, path: &str, local_path: &Path) -> Result<()>;

    /// Open stored data for streaming
    async fn open(&self, path: &str) -> Result<BlobReader>;

    /// Delete data from storage; deleting a missing path is not an error
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List every stored path
    async fn list(&self) -> Result<Vec<String>>;

    /// Get the storage type name
    fn storage_type(&self) -> &'static str;
}
