use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{AppError, Result};
use crate::storage::{BlobReader, StorageProvider};

/// Suffix of a blob copy that has not been renamed into place yet
pub const PARTIAL_SUFFIX: &str = ".tmp";

/// Local file system storage provider
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn get_full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    /// Copy then rename, for when the source lives on another filesystem
    async fn copy_into_place(&self, local_path: &Path, full_path: &Path) -> Result<()> {
        let mut temp_path = full_path.as_os_str().to_owned();
        temp_path.push(PARTIAL_SUFFIX);
        let temp_path = PathBuf::from(temp_path);
        fs::copy(local_path, &temp_path).await?;
        fs::File::open(&temp_path).await?.sync_all().await?;
        if let Err(e) = fs::rename(&temp_path, full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        fs::remove_file(local_path).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    async fn put_file(&self, path: &str, local_path: &Path) -> Result<()> {
        let full_path = self.get_full_path(path);

        // Ensure parent directory exists
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if let Err(e) = fs::rename(local_path, &full_path).await {
            tracing::debug!("Rename {:?} -> {:?} failed ({}), copying instead", local_path, full_path, e);
            self.copy_into_place(local_path, &full_path).await?;
        }

        tracing::debug!("Stored blob at {:?}", full_path);
        Ok(())
    }

    async fn open(&self, path: &str) -> Result<BlobReader> {
        let full_path = self.get_full_path(path);

        let file = fs::File::open(&full_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("Blob not found: {}", path))
            } else {
                AppError::Storage(format!("Failed to open blob: {}", e))
            }
        })?;

        Ok(Box::pin(file))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.get_full_path(path);

        match fs::remove_file(&full_path).await {
            Ok(()) => tracing::debug!("Deleted blob {:?}", full_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        // Try to remove empty parent directories
        let mut current_dir = full_path.parent().map(|p| p.to_path_buf());
        while let Some(dir) = current_dir {
            if dir == self.base_path {
                break;
            }
            match fs::read_dir(&dir).await {
                Ok(mut entries) => {
                    if entries.next_entry().await?.is_some() {
                        break; // Not empty
                    }
                    let _ = fs::remove_dir(&dir).await;
                }
                Err(_) => break,
            }
            current_dir = dir.parent().map(|p| p.to_path_buf());
        }

        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.get_full_path(path);
        Ok(fs::try_exists(full_path).await?)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        if !fs::try_exists(&self.base_path).await? {
            return Ok(paths);
        }

        let mut pending = vec![self.base_path.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if let Ok(relative) = entry.path().strip_prefix(&self.base_path) {
                    let parts: Vec<_> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    paths.push(parts.join("/"));
                }
            }
        }

        paths.sort();
        Ok(paths)
    }

    fn storage_type(&self) -> &'static str {
        "local"
    }
}
