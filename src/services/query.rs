use sqlx::{QueryBuilder, Sqlite};

use crate::db::Database;
use crate::error::Result;
use crate::models::{FileRecord, FileRow, FileTypeFilter, SearchCriteria};
use crate::services::file::SELECT_FILE_ROWS;

/// Read-only listing and filtering over the catalog
pub struct QueryService;

impl QueryService {
    /// All file records, newest first
    pub async fn list(db: &Database) -> Result<Vec<FileRecord>> {
        Self::search(db, &SearchCriteria::default()).await
    }

    /// File records matching every present criterion, newest first
    pub async fn search(db: &Database, criteria: &SearchCriteria) -> Result<Vec<FileRecord>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_FILE_ROWS);
        query.push(" WHERE 1 = 1");

        match &criteria.file_type {
            Some(FileTypeFilter::Exact(file_type)) => {
                query.push(" AND f.file_type = ").push_bind(file_type.clone());
            }
            Some(FileTypeFilter::Prefix(prefix)) => {
                query.push(" AND instr(f.file_type, ").push_bind(prefix.clone()).push(") = 1");
            }
            None => {}
        }
        if let Some(size_min) = criteria.size_min {
            query.push(" AND f.size >= ").push_bind(size_min);
        }
        if let Some(size_max) = criteria.size_max {
            query.push(" AND f.size <= ").push_bind(size_max);
        }
        if let Some(from) = criteria.uploaded_from() {
            query.push(" AND f.uploaded_at >= ").push_bind(from);
        }
        if let Some(before) = criteria.uploaded_before() {
            query.push(" AND f.uploaded_at < ").push_bind(before);
        }
        query.push(" ORDER BY f.uploaded_at DESC, f.id ASC");

        let rows: Vec<FileRow> = query.build_query_as().fetch_all(db.pool()).await?;

        // SQLite's lower() only folds ASCII, so the name match happens here
        let needle = criteria.filename.as_ref().map(|n| n.to_lowercase());
        Ok(rows
            .into_iter()
            .filter(|row| match &needle {
                Some(needle) => row.original_filename.to_lowercase().contains(needle.as_str()),
                None => true,
            })
            .map(FileRecord::from)
            .collect())
    }
}
