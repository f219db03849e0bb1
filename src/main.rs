mod config;
mod db;
mod error;
mod handlers;
mod models;
mod services;
mod storage;

use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::services::ContentStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub store: Arc<ContentStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dedupvault=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting DedupVault...");

    // Load configuration
    let config = Config::load()?;
    tracing::info!("Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database.path, config.database.max_connections).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    // Initialize content store and collect leftovers from a previous run
    let store = Arc::new(ContentStore::from_config(db.clone(), &config.storage));
    let report = store.sweep().await?;
    tracing::info!(
        "Content store ready at {} ({} orphaned blobs, {} unfinished copies, {} staging files removed)",
        config.storage.root,
        report.orphans_removed,
        report.partials_removed,
        report.staging_removed
    );

    let sweeper = config
        .storage
        .gc_interval()
        .map(|interval| store.clone().spawn_sweeper(interval));

    let state = AppState { db, store };
    let app = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route(
            "/files",
            get(handlers::file::list_files).post(handlers::file::upload_file),
        )
        .route("/files/search", get(handlers::file::search_files))
        .route("/files/stats", get(handlers::file::storage_stats))
        .route(
            "/files/:id",
            get(handlers::file::get_file).delete(handlers::file::delete_file),
        )
        .route("/files/:id/download", get(handlers::file::download_file))
        .route("/content/:key", get(handlers::file::download_content))
        // Upload size is enforced while streaming
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
