use chrono::Utc;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{format_timestamp, ContentBlob, FileRecord, FileRow, NewFile};
use crate::services::deadline::bounded;
use crate::services::hashing::StagedBlob;
use crate::services::ContentStore;
use crate::storage::BlobReader;

/// Catalog rows with the derived canonical record of each content key:
/// the earliest surviving upload, ties broken by insertion order.
pub(crate) const SELECT_FILE_ROWS: &str = r#"
    SELECT f.id, f.original_filename, f.file_type, f.size, f.uploaded_at, f.content_key,
        (SELECT o.id FROM files AS o
         WHERE o.content_key = f.content_key
         ORDER BY o.uploaded_at ASC, o.seq ASC
         LIMIT 1) AS canonical_id
    FROM files AS f
"#;

/// File catalog service
pub struct FileService;

impl FileService {
    /// Get a file record by ID
    pub async fn get_file(db: &Database, file_id: &str) -> Result<FileRecord> {
        let row: FileRow = sqlx::query_as(&format!("{} WHERE f.id = ?", SELECT_FILE_ROWS))
            .bind(file_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

        Ok(FileRecord::from(row))
    }

    /// Record already-staged content as a new file
    pub async fn upload_file(
        store: &ContentStore,
        file: NewFile,
        staged: StagedBlob,
        expected_hash: Option<&str>,
    ) -> Result<FileRecord> {
        if file.original_filename.trim().is_empty() {
            return Err(AppError::BadRequest("No file name provided".to_string()));
        }

        let mut lease = store.put(staged, expected_hash).await?;
        let content_key = lease.content_key().to_string();
        let byte_size = lease.byte_size();

        let file_id = Uuid::new_v4().to_string();
        let now = format_timestamp(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO files (id, original_filename, file_type, size, uploaded_at, content_key)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file_id)
        .bind(&file.original_filename)
        .bind(file.resolved_file_type())
        .bind(byte_size)
        .bind(&now)
        .bind(&content_key)
        .execute(&mut **lease.transaction()?)
        .await?;

        let created = lease.created();
        lease.commit().await?;

        tracing::info!(
            "Uploaded {} as {} ({})",
            file.original_filename,
            file_id,
            if created { "new content" } else { "duplicate content" }
        );

        Self::get_file(store.db(), &file_id).await
    }

    /// Delete a file record and release its content
    pub async fn delete_file(store: &ContentStore, file_id: &str) -> Result<()> {
        bounded(store.lookup_timeout(), "delete", async {
            let file = Self::get_file(store.db(), file_id).await?;

            let guard = store.lock(&file.content_key).await;
            let mut tx = store.db().pool().begin().await?;

            let deleted = sqlx::query("DELETE FROM files WHERE id = ?")
                .bind(file_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if deleted == 0 {
                // Lost a race with a concurrent delete of the same record
                return Err(AppError::NotFound("File not found".to_string()));
            }

            let reclaim = store.release(&guard, &mut tx, &file.content_key).await?;
            tx.commit().await?;

            if let Some(storage_path) = reclaim {
                store.reclaim(&guard, &storage_path).await;
            }

            tracing::info!("Deleted file {} ({})", file_id, file.original_filename);
            Ok(())
        })
        .await
    }

    /// Open the content of a file record for download
    pub async fn open_file(
        store: &ContentStore,
        file_id: &str,
    ) -> Result<(FileRecord, ContentBlob, BlobReader)> {
        bounded(store.lookup_timeout(), "download", async {
            let file = Self::get_file(store.db(), file_id).await?;
            let (blob, reader) = store.open(&file.content_key).await?;
            Ok((file, blob, reader))
        })
        .await
    }

    /// Open content directly by its key
    pub async fn open_content(
        store: &ContentStore,
        content_key: &str,
    ) -> Result<(ContentBlob, BlobReader)> {
        bounded(store.lookup_timeout(), "download", store.open(content_key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::services::testing::{chunks, temp_store, temp_store_with, upload_stream};
    use crate::services::StatsService;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    async fn upload(store: &ContentStore, name: &str, content: &[u8]) -> FileRecord {
        upload_stream(store, NewFile::new(name, Some("text/plain".into())), chunks(&[content]), None)
            .await
            .unwrap()
    }

    async fn blob_ref_count(store: &ContentStore, key: &str) -> Option<i64> {
        sqlx::query_scalar("SELECT ref_count FROM content_blobs WHERE content_key = ?")
            .bind(key)
            .fetch_optional(store.db().pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hello_scenario() {
        let (_dir, store) = temp_store().await;

        let a1 = upload(&store, "a.txt", b"hello").await;
        assert!(!a1.is_duplicate);
        assert_eq!(a1.original_file, None);
        assert_eq!(a1.size, 5);
        let stats = StatsService::snapshot(store.db()).await.unwrap();
        assert_eq!((stats.total_physical_size, stats.total_logical_size, stats.saved_space), (5, 5, 0));

        let b1 = upload(&store, "b.txt", b"hello").await;
        assert!(b1.is_duplicate);
        assert_eq!(b1.original_file.as_deref(), Some(a1.id.as_str()));
        assert_eq!(b1.content_key, a1.content_key);
        let stats = StatsService::snapshot(store.db()).await.unwrap();
        assert_eq!((stats.total_physical_size, stats.total_logical_size, stats.saved_space), (5, 10, 5));

        FileService::delete_file(&store, &a1.id).await.unwrap();

        // B1 survives and becomes the canonical record for the content
        let b1 = FileService::get_file(store.db(), &b1.id).await.unwrap();
        assert!(!b1.is_duplicate);
        assert_eq!(b1.original_file, None);
        let stats = StatsService::snapshot(store.db()).await.unwrap();
        assert_eq!((stats.total_physical_size, stats.total_logical_size, stats.saved_space), (5, 5, 0));
    }

    #[tokio::test]
    async fn test_duplicates_point_at_first_upload() {
        let (_dir, store) = temp_store().await;

        let first = upload(&store, "one.txt", b"same bytes").await;
        let mut dups = Vec::new();
        for i in 0..3 {
            dups.push(upload(&store, &format!("copy{}.txt", i), b"same bytes").await);
        }

        for dup in &dups {
            assert!(dup.is_duplicate);
            assert_eq!(dup.original_file.as_deref(), Some(first.id.as_str()));
        }
        assert_eq!(blob_ref_count(&store, &first.content_key).await, Some(4));

        // Removing the canonical record promotes the next-earliest survivor
        FileService::delete_file(&store, &first.id).await.unwrap();
        let promoted = FileService::get_file(store.db(), &dups[0].id).await.unwrap();
        assert!(!promoted.is_duplicate);
        for dup in &dups[1..] {
            let dup = FileService::get_file(store.db(), &dup.id).await.unwrap();
            assert_eq!(dup.original_file.as_deref(), Some(promoted.id.as_str()));
        }
        assert_eq!(blob_ref_count(&store, &first.content_key).await, Some(3));
    }

    #[tokio::test]
    async fn test_deleting_all_references_reclaims_blob() {
        let (dir, store) = temp_store().await;

        let a = upload(&store, "a.bin", b"payload").await;
        let b = upload(&store, "b.bin", b"payload").await;
        let other = upload(&store, "c.bin", b"other").await;

        FileService::delete_file(&store, &a.id).await.unwrap();
        assert_eq!(
            StatsService::snapshot(store.db()).await.unwrap().total_physical_size,
            7 + 5
        );

        FileService::delete_file(&store, &b.id).await.unwrap();
        assert_eq!(blob_ref_count(&store, &a.content_key).await, None);
        let blob_path = dir
            .path()
            .join("objects")
            .join(crate::models::blob_storage_path(&a.content_key));
        assert!(!blob_path.exists());

        let stats = StatsService::snapshot(store.db()).await.unwrap();
        assert_eq!(stats.total_physical_size, 5);
        assert_eq!(stats.original_files_count, 1);
        assert!(FileService::get_file(store.db(), &other.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (_dir, store) = temp_store().await;
        assert!(matches!(
            FileService::delete_file(&store, "missing").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            FileService::get_file(store.db(), "missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_download_round_trip() {
        let (_dir, store) = temp_store().await;
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let parts: Vec<&[u8]> = content.chunks(4096).collect();

        let record = upload_stream(&store, NewFile::new("data.bin", None), chunks(&parts), None)
            .await
            .unwrap();
        assert_eq!(record.file_type, "application/octet-stream");
        assert_eq!(record.size, content.len() as i64);

        let (file, blob, mut reader) = FileService::open_file(&store, &record.id).await.unwrap();
        let mut downloaded = Vec::new();
        reader.read_to_end(&mut downloaded).await.unwrap();
        assert_eq!(downloaded, content);
        assert_eq!(file.id, record.id);
        assert_eq!(blob.byte_size, file.size);

        let (_, mut reader) = FileService::open_content(&store, &record.content_key).await.unwrap();
        let mut by_key = Vec::new();
        reader.read_to_end(&mut by_key).await.unwrap();
        assert_eq!(by_key, content);
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_no_record() {
        let (dir, store) = temp_store().await;

        let failing = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated")),
        ]);
        assert!(upload_stream(&store, NewFile::new("x.txt", None), failing, None)
            .await
            .is_err());

        let staged = store.stage(chunks(&[b"hello"])).await.unwrap();
        let err = FileService::upload_file(&store, NewFile::new("x.txt", None), staged, Some("f".repeat(64).as_str()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::HashMismatch { .. }));

        let stats = StatsService::snapshot(store.db()).await.unwrap();
        assert_eq!(stats.total_files_count, 0);
        assert_eq!(stats.original_files_count, 0);
        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_upload_times_out_and_rolls_back() {
        let (dir, store) = temp_store_with(StorageConfig {
            upload_timeout_secs: 1,
            ..Default::default()
        })
        .await;

        let stalled = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"first chunk"))])
            .chain(futures::stream::pending());

        let err = upload_stream(&store, NewFile::new("slow.bin", None), stalled, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));

        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(store.db().pool())
            .await
            .unwrap();
        let blobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_blobs")
            .fetch_one(store.db().pool())
            .await
            .unwrap();
        assert_eq!((files, blobs), (0, 0));
    }

    #[tokio::test]
    async fn test_concurrent_identical_uploads_share_one_blob() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    upload_stream(
                        &store,
                        NewFile::new(format!("f{}.txt", i), None),
                        chunks(&[b"concurrent", b" content"]),
                        None,
                    )
                    .await
                })
            })
            .collect();

        let mut records = Vec::new();
        for task in tasks {
            records.push(task.await.unwrap().unwrap());
        }

        let originals: Vec<_> = records.iter().filter(|r| !r.is_duplicate).collect();
        assert_eq!(originals.len(), 1);
        for record in records.iter().filter(|r| r.is_duplicate) {
            assert_eq!(record.original_file.as_deref(), Some(originals[0].id.as_str()));
        }

        let stats = StatsService::snapshot(store.db()).await.unwrap();
        assert_eq!(stats.original_files_count, 1);
        assert_eq!(stats.total_files_count, 8);
        assert_eq!(blob_ref_count(&store, &records[0].content_key).await, Some(8));
    }

    #[tokio::test]
    async fn test_concurrent_delete_and_upload() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        let existing = upload(&store, "old.txt", b"contended").await;

        let deleter = {
            let store = store.clone();
            let id = existing.id.clone();
            tokio::spawn(async move { FileService::delete_file(&store, &id).await })
        };
        let uploader = {
            let store = store.clone();
            tokio::spawn(async move {
                upload_stream(&store, NewFile::new("new.txt", None), chunks(&[b"contended"]), None)
                    .await
            })
        };

        deleter.await.unwrap().unwrap();
        let fresh = uploader.await.unwrap().unwrap();

        // Whatever the interleaving, the surviving record must be downloadable
        assert_eq!(blob_ref_count(&store, &fresh.content_key).await, Some(1));
        let (_, _, mut reader) = FileService::open_file(&store, &fresh.id).await.unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"contended");
    }
}
