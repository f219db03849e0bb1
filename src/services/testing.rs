//! Shared fixtures for service tests

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, Stream};
use std::fmt::Display;
use std::path::Path;
use tempfile::TempDir;

use crate::config::StorageConfig;
use crate::db::Database;
use crate::error::Result;
use crate::models::{FileRecord, NewFile};
use crate::services::deadline::bounded;
use crate::services::{ContentStore, FileService};
use crate::storage::{BlobReader, StorageProvider};

pub async fn temp_db(dir: &Path) -> Database {
    let db = Database::new(dir.join("test.db").to_str().unwrap(), 5)
        .await
        .unwrap();
    db.run_migrations().await.unwrap();
    db
}

/// Store rooted in a fresh temporary directory
pub async fn temp_store() -> (TempDir, ContentStore) {
    temp_store_with(StorageConfig::default()).await
}

/// Like `temp_store`, with `root` replaced by the temporary directory
pub async fn temp_store_with(config: StorageConfig) -> (TempDir, ContentStore) {
    let dir = tempfile::tempdir().unwrap();
    let db = temp_db(dir.path()).await;
    let config = StorageConfig {
        root: dir.path().to_string_lossy().into_owned(),
        ..config
    };
    let store = ContentStore::from_config(db, &config);
    (dir, store)
}

/// Stage and record a whole upload stream within the upload timeout,
/// the same way the multipart handler does
pub async fn upload_stream<S, E>(
    store: &ContentStore,
    file: NewFile,
    stream: S,
    expected_hash: Option<&str>,
) -> Result<FileRecord>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Display,
{
    bounded(store.upload_timeout(), "upload", async {
        let staged = store.stage(stream).await?;
        FileService::upload_file(store, file, staged, expected_hash).await
    })
    .await
}

/// Upload body split into the given chunks
pub fn chunks(parts: &[&[u8]]) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> {
    stream::iter(
        parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect::<Vec<_>>(),
    )
}

/// Provider whose storage medium rejects every write
pub struct FailingStorage;

#[async_trait]
impl StorageProvider for FailingStorage {
    async fn put_file(&self, _path: &str, _local_path: &Path) -> Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
    }

    async fn open(&self, path: &str) -> Result<BlobReader> {
        Err(crate::error::AppError::NotFound(format!("Blob not found: {}", path)))
    }

    async fn delete(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _path: &str) -> Result<bool> {
        Ok(false)
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn storage_type(&self) -> &'static str {
        "failing"
    }
}
