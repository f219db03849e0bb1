use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::error::{AppError, Result};

const STAGING_EXT: &str = "part";

/// Upload bytes persisted to the staging area with their computed key.
///
/// The staging file is removed on drop unless the store took ownership of
/// it, so an abandoned upload never leaves bytes behind.
#[derive(Debug)]
pub struct StagedBlob {
    content_key: String,
    byte_size: i64,
    path: PathBuf,
    persisted: bool,
}

impl StagedBlob {
    pub fn content_key(&self) -> &str {
        &self.content_key
    }

    pub fn byte_size(&self) -> i64 {
        self.byte_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The staging file has been moved into the store
    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = true;
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if !self.persisted {
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!("Discarded staging file {:?}", self.path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove staging file {:?}: {}", self.path, e),
            }
        }
    }
}

/// Streams upload chunks to a staging file while computing their SHA-256
pub struct HashingPipeline {
    staging_dir: PathBuf,
    max_bytes: Option<u64>,
}

impl HashingPipeline {
    pub fn new(staging_dir: impl Into<PathBuf>, max_bytes: Option<u64>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            max_bytes,
        }
    }

    /// Consume `stream`, writing every chunk to staging and into the digest
    pub async fn stage<S, E>(&self, stream: S) -> Result<StagedBlob>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        fs::create_dir_all(&self.staging_dir).await?;

        // Guard first, so cancellation at any await below removes the file
        let mut staged = StagedBlob {
            content_key: String::new(),
            byte_size: 0,
            path: self
                .staging_dir
                .join(format!("{}.{}", Uuid::new_v4(), STAGING_EXT)),
            persisted: false,
        };

        let file = fs::File::create(&staged.path).await?;
        let mut writer = BufWriter::new(file);
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;

        let mut stream = std::pin::pin!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| AppError::BadRequest(format!("Failed to read upload stream: {}", e)))?;

            total += chunk.len() as u64;
            if let Some(max) = self.max_bytes {
                if total > max {
                    return Err(AppError::BadRequest(format!(
                        "Upload exceeds the {} byte limit",
                        max
                    )));
                }
            }

            hasher.update(&chunk);
            writer.write_all(&chunk).await?;
        }

        writer.flush().await?;
        writer.get_ref().sync_all().await?;

        staged.content_key = hex::encode(hasher.finalize());
        staged.byte_size = i64::try_from(total)
            .map_err(|_| AppError::BadRequest("Upload too large".to_string()))?;

        tracing::debug!(
            "Staged {} bytes as {} at {:?}",
            staged.byte_size,
            staged.content_key,
            staged.path
        );
        Ok(staged)
    }

    /// Remove staging files older than `max_age`, returning how many were removed
    pub async fn clear_stale(&self, max_age: Duration) -> Result<usize> {
        if !fs::try_exists(&self.staging_dir).await? {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.staging_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STAGING_EXT) {
                continue;
            }

            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= max_age {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(removed)
    }
}
