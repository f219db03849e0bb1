use serde::Serialize;

/// Derived storage accounting, computed on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StorageStatsSnapshot {
    pub total_files_count: i64,
    pub original_files_count: i64,
    pub deduplicated_files_count: i64,
    pub total_physical_size: i64,
    pub total_logical_size: i64,
    pub saved_space: i64,
}

impl StorageStatsSnapshot {
    /// Build a snapshot from the four measured totals
    pub fn from_totals(
        total_files_count: i64,
        original_files_count: i64,
        total_logical_size: i64,
        total_physical_size: i64,
    ) -> Self {
        Self {
            total_files_count,
            original_files_count,
            deduplicated_files_count: total_files_count - original_files_count,
            total_physical_size,
            total_logical_size,
            saved_space: total_logical_size - total_physical_size,
        }
    }
}
