pub mod file;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::error::{ApiResponse, Result};
use crate::AppState;

#[derive(Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub storage: &'static str,
}

/// Liveness probe; also checks the database answers
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Result<Json<ApiResponse<HealthStatus>>> {
    sqlx::query("SELECT 1").execute(state.db.pool()).await?;
    Ok(Json(ApiResponse::success(HealthStatus {
        status: "ok",
        storage: state.store.storage_type(),
    })))
}
