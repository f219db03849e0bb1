use crate::db::Database;
use crate::error::Result;
use crate::models::StorageStatsSnapshot;

/// Storage accounting service
pub struct StatsService;

impl StatsService {
    /// Compute storage totals from a single consistent read
    pub async fn snapshot(db: &Database) -> Result<StorageStatsSnapshot> {
        let mut tx = db.pool().begin().await?;

        let (total_files, logical_size): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(size), 0) FROM files")
                .fetch_one(&mut *tx)
                .await?;

        let (original_files, physical_size): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(byte_size), 0) FROM content_blobs")
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(StorageStatsSnapshot::from_totals(
            total_files,
            original_files,
            logical_size,
            physical_size,
        ))
    }
}
