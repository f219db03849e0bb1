use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tokio_util::io::ReaderStream;

use crate::error::{ApiResponse, AppError, Result};
use crate::models::{FileRecord, NewFile, SearchCriteria, SearchQuery, StorageStatsSnapshot};
use crate::services::deadline::bounded;
use crate::services::{FileService, QueryService, StatsService};
use crate::storage::BlobReader;
use crate::AppState;

/// List all files, newest first
/// GET /api/v1/files
pub async fn list_files(State(state): State<AppState>) -> Result<Json<ApiResponse<Vec<FileRecord>>>> {
    let files = bounded(
        state.store.lookup_timeout(),
        "list",
        QueryService::list(&state.db),
    )
    .await?;
    Ok(Json(ApiResponse::success(files)))
}

/// Search files
/// GET /api/v1/files/search?filename=&file_type=&size_min=&size_max=&date_from=&date_to=
pub async fn search_files(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ApiResponse<Vec<FileRecord>>>> {
    let criteria = SearchCriteria::try_from(query)?;
    let files = bounded(
        state.store.lookup_timeout(),
        "search",
        QueryService::search(&state.db, &criteria),
    )
    .await?;
    Ok(Json(ApiResponse::success(files)))
}

/// Storage statistics
/// GET /api/v1/files/stats
pub async fn storage_stats(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<StorageStatsSnapshot>>> {
    let stats = bounded(
        state.store.lookup_timeout(),
        "stats",
        StatsService::snapshot(&state.db),
    )
    .await?;
    Ok(Json(ApiResponse::success(stats)))
}

/// Get a specific file
/// GET /api/v1/files/:id
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<FileRecord>>> {
    let file = bounded(
        state.store.lookup_timeout(),
        "get",
        FileService::get_file(&state.db, &id),
    )
    .await?;
    Ok(Json(ApiResponse::success(file)))
}

/// Upload a file
/// POST /api/v1/files (multipart: `file`, optional `sha256`)
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<FileRecord>>> {
    let store = &state.store;

    let file = bounded(store.upload_timeout(), "upload", async {
        let mut staged = None;
        let mut new_file = None;
        let mut expected_hash: Option<String> = None;

        while let Some(field) = multipart.next_field().await.map_err(|e| {
            AppError::BadRequest(format!("Failed to process multipart: {}", e))
        })? {
            let name = field.name().unwrap_or("").to_string();

            match name.as_str() {
                "file" => {
                    let file_name = field
                        .file_name()
                        .map(|s| s.to_string())
                        .ok_or_else(|| AppError::BadRequest("No file name provided".to_string()))?;
                    let content_type = field.content_type().map(|s| s.to_string());

                    staged = Some(store.stage(field).await?);
                    new_file = Some(NewFile::new(file_name, content_type));
                }
                "sha256" => {
                    let text = field.text().await.map_err(|e| {
                        AppError::BadRequest(format!("Failed to read sha256 field: {}", e))
                    })?;
                    if !text.trim().is_empty() {
                        expected_hash = Some(text);
                    }
                }
                _ => {}
            }
        }

        let staged = staged.ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;
        let new_file = new_file.ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;

        FileService::upload_file(store, new_file, staged, expected_hash.as_deref()).await
    })
    .await?;

    Ok(Json(ApiResponse::success(file)))
}

/// Delete a file
/// DELETE /api/v1/files/:id
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    FileService::delete_file(&state.store, &id).await?;
    Ok(Json(ApiResponse::<()>::success_message("File deleted")))
}

/// Download a file under its original name
/// GET /api/v1/files/:id/download
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let (file, blob, reader) = FileService::open_file(&state.store, &id).await?;
    stream_response(reader, &file.file_type, blob.byte_size, &file.original_filename)
}

/// Download content by its key
/// GET /api/v1/content/:key
pub async fn download_content(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response> {
    let (blob, reader) = FileService::open_content(&state.store, &key).await?;
    stream_response(reader, "application/octet-stream", blob.byte_size, &blob.content_key)
}

fn stream_response(
    reader: BlobReader,
    content_type: &str,
    content_length: i64,
    file_name: &str,
) -> Result<Response> {
    let fallback_name = file_name.replace(['"', '\\'], "_");
    let encoded_name = urlencoding::encode(file_name);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, content_length)
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                fallback_name, encoded_name
            ),
        )
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}
