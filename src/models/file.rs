use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::AppError;

/// Catalog row joined with the canonical record id of its content key
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub id: String,
    pub original_filename: String,
    pub file_type: String,
    pub size: i64,
    pub uploaded_at: String,
    pub content_key: String,
    pub canonical_id: String,
}

/// Logical, user-visible file record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub original_filename: String,
    pub file_type: String,
    pub size: i64,
    pub uploaded_at: String,
    pub content_key: String,
    pub is_duplicate: bool,
    pub original_file: Option<String>,
}

impl From<FileRow> for FileRecord {
    fn from(row: FileRow) -> Self {
        let is_duplicate = row.canonical_id != row.id;
        Self {
            id: row.id,
            original_filename: row.original_filename,
            file_type: row.file_type,
            size: row.size,
            uploaded_at: row.uploaded_at,
            content_key: row.content_key,
            is_duplicate,
            original_file: is_duplicate.then_some(row.canonical_id),
        }
    }
}

/// Declared metadata of an upload
#[derive(Debug, Clone)]
pub struct NewFile {
    pub original_filename: String,
    pub file_type: Option<String>,
}

impl NewFile {
    pub fn new(original_filename: impl Into<String>, file_type: Option<String>) -> Self {
        Self {
            original_filename: original_filename.into(),
            file_type,
        }
    }

    /// Declared type, or a guess from the file extension
    pub fn resolved_file_type(&self) -> String {
        match self.file_type.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => mime_guess::from_path(&self.original_filename)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        }
    }
}

/// Fixed-width UTC timestamp; text order equals chronological order
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn start_of_day(date: NaiveDate) -> String {
    format_timestamp(date.and_time(NaiveTime::MIN).and_utc())
}

/// Search query string parameters, as received
#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub filename: Option<String>,
    pub file_type: Option<String>,
    pub size_min: Option<String>,
    pub size_max: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

/// `file_type` matching policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTypeFilter {
    Exact(String),
    /// `image/*` matches every type starting with `image/`
    Prefix(String),
}

impl FileTypeFilter {
    pub fn parse(value: &str) -> Self {
        match value.strip_suffix('*') {
            Some(prefix) if prefix.ends_with('/') => FileTypeFilter::Prefix(prefix.to_string()),
            _ => FileTypeFilter::Exact(value.to_string()),
        }
    }
}

/// Validated search criteria; every present field must match
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub filename: Option<String>,
    pub file_type: Option<FileTypeFilter>,
    pub size_min: Option<i64>,
    pub size_max: Option<i64>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl SearchCriteria {
    /// Inclusive lower bound on `uploaded_at`
    pub fn uploaded_from(&self) -> Option<String> {
        self.date_from.map(start_of_day)
    }

    /// Exclusive upper bound on `uploaded_at` (start of the day after `date_to`)
    pub fn uploaded_before(&self) -> Option<String> {
        self.date_to
            .map(|d| d.succ_opt().map(start_of_day).unwrap_or_else(|| "9999".to_string()))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_size(value: Option<String>, name: &str) -> Result<Option<i64>, AppError> {
    non_empty(value)
        .map(|v| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| AppError::BadRequest(format!("Invalid {} format", name)))
        })
        .transpose()
}

fn parse_date(value: Option<String>, name: &str) -> Result<Option<NaiveDate>, AppError> {
    non_empty(value)
        .map(|v| {
            NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").map_err(|_| {
                AppError::BadRequest(format!("Invalid {} format (YYYY-MM-DD)", name))
            })
        })
        .transpose()
}

impl TryFrom<SearchQuery> for SearchCriteria {
    type Error = AppError;

    fn try_from(query: SearchQuery) -> Result<Self, Self::Error> {
        Ok(Self {
            filename: non_empty(query.filename),
            file_type: non_empty(query.file_type).map(|t| FileTypeFilter::parse(t.trim())),
            size_min: parse_size(query.size_min, "size_min")?,
            size_max: parse_size(query.size_max, "size_max")?,
            date_from: parse_date(query.date_from, "date_from")?,
            date_to: parse_date(query.date_to, "date_to")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(id: &str, canonical_id: &str) -> FileRow {
        FileRow {
            id: id.to_string(),
            original_filename: "a.txt".to_string(),
            file_type: "text/plain".to_string(),
            size: 5,
            uploaded_at: "2023-01-15T10:00:00.000000Z".to_string(),
            content_key: "k".to_string(),
            canonical_id: canonical_id.to_string(),
        }
    }

    #[test]
    fn test_canonical_row_is_not_duplicate() {
        let record = FileRecord::from(row("a", "a"));
        assert!(!record.is_duplicate);
        assert_eq!(record.original_file, None);

        let record = FileRecord::from(row("b", "a"));
        assert!(record.is_duplicate);
        assert_eq!(record.original_file.as_deref(), Some("a"));
    }

    #[test]
    fn test_original_file_serializes_as_null() {
        let json = serde_json::to_value(FileRecord::from(row("a", "a"))).unwrap();
        assert!(json.get("original_file").unwrap().is_null());
        assert_eq!(json["is_duplicate"], false);
    }

    #[test]
    fn test_timestamp_is_fixed_width() {
        let a = format_timestamp(Utc.with_ymd_and_hms(2023, 1, 15, 10, 0, 0).unwrap());
        assert_eq!(a, "2023-01-15T10:00:00.000000Z");
        let b = format_timestamp(
            Utc.with_ymd_and_hms(2023, 1, 15, 10, 0, 0).unwrap() + chrono::Duration::microseconds(1),
        );
        assert!(a < b);
    }

    #[test]
    fn test_resolved_file_type() {
        assert_eq!(NewFile::new("a.png", Some("image/png".into())).resolved_file_type(), "image/png");
        assert_eq!(NewFile::new("a.png", Some("  ".into())).resolved_file_type(), "image/png");
        assert_eq!(NewFile::new("photo.jpg", None).resolved_file_type(), "image/jpeg");
        assert_eq!(NewFile::new("blob", None).resolved_file_type(), "application/octet-stream");
    }

    #[test]
    fn test_file_type_filter() {
        assert_eq!(FileTypeFilter::parse("image/*"), FileTypeFilter::Prefix("image/".into()));
        assert_eq!(FileTypeFilter::parse("image/png"), FileTypeFilter::Exact("image/png".into()));
        assert_eq!(FileTypeFilter::parse("*"), FileTypeFilter::Exact("*".into()));
    }

    #[test]
    fn test_criteria_parsing() {
        let criteria = SearchCriteria::try_from(SearchQuery {
            filename: Some("".into()),
            size_min: Some("15".into()),
            date_to: Some("2023-01-20".into()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(criteria.filename, None);
        assert_eq!(criteria.size_min, Some(15));
        assert_eq!(
            criteria.uploaded_before().as_deref(),
            Some("2023-01-21T00:00:00.000000Z")
        );
        assert_eq!(SearchCriteria::try_from(SearchQuery::default()).unwrap().uploaded_from(), None);
    }

    #[test]
    fn test_criteria_rejects_bad_input() {
        let err = SearchCriteria::try_from(SearchQuery {
            size_min: Some("notanumber".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "Bad request: Invalid size_min format");

        let err = SearchCriteria::try_from(SearchQuery {
            date_from: Some("01-01-2023".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "Bad request: Invalid date_from format (YYYY-MM-DD)");

        assert!(SearchCriteria::try_from(SearchQuery {
            date_to: Some("2023/01/01".into()),
            ..Default::default()
        })
        .is_err());
    }
}
