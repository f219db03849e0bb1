use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use sqlx::{Sqlite, Transaction};
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::StorageConfig;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{blob_storage_path, format_timestamp, is_content_key, ContentBlob};
use crate::services::hashing::{HashingPipeline, StagedBlob};
use crate::services::locks::{KeyGuard, KeyedLocks};
use crate::storage::{BlobReader, LocalStorage, StorageProvider, PARTIAL_SUFFIX};

const OBJECTS_DIR: &str = "objects";
const STAGING_DIR: &str = "staging";

/// Deduplicating content store: blob index in SQLite, bytes in a provider
pub struct ContentStore {
    db: Database,
    provider: Arc<dyn StorageProvider>,
    pipeline: HashingPipeline,
    locks: KeyedLocks,
    upload_timeout: Duration,
    lookup_timeout: Duration,
}

/// Result of one garbage-collection pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub orphans_removed: usize,
    pub partials_removed: usize,
    pub staging_removed: usize,
}

/// Content key a provider path belongs to, and whether the path is an
/// unfinished copy of that blob rather than the blob itself
fn parse_blob_path(path: &str) -> Option<(&str, bool)> {
    let (blob_path, partial) = match path.strip_suffix(PARTIAL_SUFFIX) {
        Some(stripped) => (stripped, true),
        None => (path, false),
    };
    let content_key = blob_path.rsplit('/').next()?;
    (is_content_key(content_key) && blob_storage_path(content_key) == blob_path)
        .then_some((content_key, partial))
}

impl ContentStore {
    pub fn new(
        db: Database,
        provider: Arc<dyn StorageProvider>,
        staging_dir: impl Into<PathBuf>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            db,
            provider,
            pipeline: HashingPipeline::new(staging_dir, config.max_upload_bytes()),
            locks: KeyedLocks::new(),
            upload_timeout: config.upload_timeout(),
            lookup_timeout: config.lookup_timeout(),
        }
    }

    /// Local store laid out as `<root>/objects` and `<root>/staging`
    pub fn from_config(db: Database, config: &StorageConfig) -> Self {
        let root = PathBuf::from(&config.root);
        let provider = Arc::new(LocalStorage::new(root.join(OBJECTS_DIR)));
        Self::new(db, provider, root.join(STAGING_DIR), config)
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn upload_timeout(&self) -> Duration {
        self.upload_timeout
    }

    pub fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    pub fn storage_type(&self) -> &'static str {
        self.provider.storage_type()
    }

    /// Run an upload stream through the hashing pipeline
    pub async fn stage<S, E>(&self, stream: S) -> Result<StagedBlob>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        self.pipeline.stage(stream).await
    }

    /// Take the exclusive section for `content_key`
    pub async fn lock(&self, content_key: &str) -> KeyGuard {
        self.locks.lock(content_key).await
    }

    /// Add one reference to the staged content.
    ///
    /// Creates the blob (and moves the bytes into place) if the key is new,
    /// otherwise increments its reference count and discards the staged copy.
    /// Nothing is visible to other connections until the lease is committed.
    pub async fn put(&self, mut staged: StagedBlob, expected_hash: Option<&str>) -> Result<BlobLease> {
        if let Some(expected) = expected_hash {
            let expected = expected.trim().to_ascii_lowercase();
            if expected != staged.content_key() {
                return Err(AppError::HashMismatch {
                    expected,
                    actual: staged.content_key().to_string(),
                });
            }
        }

        let content_key = staged.content_key().to_string();
        let byte_size = staged.byte_size();
        let storage_path = blob_storage_path(&content_key);

        let guard = self.locks.lock(&content_key).await;
        let mut tx = self.db.pool().begin().await?;

        // Insert-if-absent; the write comes first so SQLite takes the write
        // lock up front and concurrent writers wait on the busy handler.
        let (ref_count, stored_size): (i64, i64) = sqlx::query_as(
            r#"
            INSERT INTO content_blobs (content_key, byte_size, ref_count, storage_path, created_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(content_key) DO UPDATE SET ref_count = ref_count + 1
            RETURNING ref_count, byte_size
            "#,
        )
        .bind(&content_key)
        .bind(byte_size)
        .bind(&storage_path)
        .bind(format_timestamp(Utc::now()))
        .fetch_one(&mut *tx)
        .await?;

        if stored_size != byte_size {
            return Err(AppError::Storage(format!(
                "Content key collision on {}: stored {} bytes, uploaded {}",
                content_key, stored_size, byte_size
            )));
        }

        let mut lease = BlobLease {
            tx: Some(tx),
            content_key,
            byte_size,
            created: ref_count == 1,
            placed: None,
            guard: Some(guard),
        };

        if lease.created {
            self.provider.put_file(&storage_path, staged.path()).await?;
            staged.mark_persisted();
            lease.placed = Some((self.provider.clone(), storage_path));
            tracing::debug!("Created blob {} ({} bytes)", lease.content_key, byte_size);
        } else if !self.provider.exists(&storage_path).await? {
            // Indexed but the bytes are gone; this upload carries them
            self.provider.put_file(&storage_path, staged.path()).await?;
            staged.mark_persisted();
            tracing::warn!("Restored missing bytes of blob {}", lease.content_key);
        } else {
            tracing::debug!(
                "Deduplicated upload of {} (ref_count {})",
                lease.content_key,
                ref_count
            );
        }

        Ok(lease)
    }

    /// Drop one reference inside the caller's transaction.
    ///
    /// Returns the storage path to reclaim when the last reference went away.
    /// The caller must hold the key's guard until the reclaim is done.
    pub async fn release(
        &self,
        guard: &KeyGuard,
        tx: &mut Transaction<'static, Sqlite>,
        content_key: &str,
    ) -> Result<Option<String>> {
        debug_assert_eq!(guard.key(), content_key);

        let remaining: Option<i64> = sqlx::query_scalar(
            "UPDATE content_blobs SET ref_count = ref_count - 1 WHERE content_key = ? AND ref_count > 1 RETURNING ref_count",
        )
        .bind(content_key)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(remaining) = remaining {
            tracing::debug!("Released {} (ref_count {})", content_key, remaining);
            return Ok(None);
        }

        let storage_path: Option<String> = sqlx::query_scalar(
            "DELETE FROM content_blobs WHERE content_key = ? RETURNING storage_path",
        )
        .bind(content_key)
        .fetch_optional(&mut **tx)
        .await?;

        storage_path
            .map(Some)
            .ok_or_else(|| AppError::NotFound(format!("Content not found: {}", content_key)))
    }

    /// Delete the physical bytes of a released blob.
    /// Failures are logged and left for the sweep.
    pub async fn reclaim(&self, guard: &KeyGuard, storage_path: &str) {
        match self.provider.delete(storage_path).await {
            Ok(()) => tracing::debug!("Reclaimed blob {}", guard.key()),
            Err(e) => tracing::warn!(
                "Failed to reclaim blob {} at {}: {}; leaving it for the sweep",
                guard.key(),
                storage_path,
                e
            ),
        }
    }

    /// Look up a blob by key
    pub async fn get_blob(&self, content_key: &str) -> Result<ContentBlob> {
        if !is_content_key(content_key) {
            return Err(AppError::NotFound("Content not found".to_string()));
        }

        let blob: ContentBlob = sqlx::query_as("SELECT * FROM content_blobs WHERE content_key = ?")
            .bind(content_key)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("Content not found".to_string()))?;

        Ok(blob)
    }

    /// Open a blob's bytes for streaming
    pub async fn open(&self, content_key: &str) -> Result<(ContentBlob, BlobReader)> {
        let blob = self.get_blob(content_key).await?;
        let reader = self.provider.open(&blob.storage_path).await?;
        Ok((blob, reader))
    }

    /// Remove physical files with no blob row, unfinished copies, and
    /// staging files from dead uploads
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            staging_removed: self.pipeline.clear_stale(self.upload_timeout * 2).await?,
            ..Default::default()
        };

        for path in self.provider.list().await? {
            let Some((content_key, partial)) = parse_blob_path(&path) else {
                tracing::debug!("Sweep skipping unrecognized path {}", path);
                continue;
            };

            // Re-check under the key lock so an upload placing this blob right now is left alone
            let guard = self.locks.lock(content_key).await;

            if partial {
                // Copies into place only run under the key lock, so this one was abandoned
                self.provider.delete(&path).await?;
                report.partials_removed += 1;
                tracing::info!("Sweep removed unfinished copy of blob {}", guard.key());
                continue;
            }

            let indexed: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM content_blobs WHERE content_key = ?")
                    .bind(content_key)
                    .fetch_optional(self.db.pool())
                    .await?;

            if indexed.is_none() {
                self.provider.delete(&path).await?;
                report.orphans_removed += 1;
                tracing::info!("Sweep removed orphaned blob {}", guard.key());
            }
        }

        Ok(report)
    }

    /// Run `sweep` every `interval` until the handle is aborted
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(report) if report != SweepReport::default() => {
                        tracing::info!(
                            "Sweep removed {} orphaned blobs, {} unfinished copies and {} staging files",
                            report.orphans_removed,
                            report.partials_removed,
                            report.staging_removed
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Sweep failed: {}", e),
                }
            }
        })
    }
}

/// An uncommitted reference on a blob, holding its key lock.
///
/// Committing publishes the reference. Dropping the lease instead rolls the
/// transaction back and deletes any bytes this lease placed.
pub struct BlobLease {
    tx: Option<Transaction<'static, Sqlite>>,
    content_key: String,
    byte_size: i64,
    created: bool,
    placed: Option<(Arc<dyn StorageProvider>, String)>,
    guard: Option<KeyGuard>,
}

impl BlobLease {
    pub fn content_key(&self) -> &str {
        &self.content_key
    }

    pub fn byte_size(&self) -> i64 {
        self.byte_size
    }

    /// Whether this lease created the blob rather than adding a reference
    pub fn created(&self) -> bool {
        self.created
    }

    /// The open transaction, for writes that must commit with the reference
    pub fn transaction(&mut self) -> Result<&mut Transaction<'static, Sqlite>> {
        self.tx
            .as_mut()
            .ok_or_else(|| AppError::Internal("Blob lease already settled".to_string()))
    }

    pub async fn commit(mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| AppError::Internal("Blob lease already settled".to_string()))?;

        match tx.commit().await {
            Ok(()) => {
                self.placed = None;
                Ok(())
            }
            Err(e) => {
                if let Some((provider, path)) = self.placed.take() {
                    if let Err(de) = provider.delete(&path).await {
                        tracing::warn!("Failed to remove uncommitted blob {}: {}", path, de);
                    }
                }
                Err(e.into())
            }
        }
    }
}

impl Drop for BlobLease {
    fn drop(&mut self) {
        let Some((provider, path)) = self.placed.take() else {
            return;
        };

        // The key stays locked until the bytes are gone, otherwise a new
        // upload of the same content could place them and lose them to us.
        let tx = self.tx.take();
        let guard = self.guard.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(tx) = tx {
                        if let Err(e) = tx.rollback().await {
                            tracing::warn!("Rollback of abandoned upload failed: {}", e);
                        }
                    }
                    if let Err(e) = provider.delete(&path).await {
                        tracing::warn!("Failed to remove abandoned blob {}: {}", path, e);
                    }
                    drop(guard);
                });
            }
            Err(_) => tracing::warn!("Abandoned blob {} left for the sweep", path),
        }
    }
}
