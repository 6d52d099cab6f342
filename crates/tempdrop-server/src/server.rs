//! HTTP server: routes, shared state and the file endpoints

use crate::config::Config;
use crate::error::AppError;
use crate::types::{
    file_views, DeleteAllResponse, DeleteFilesRequest, DeleteFilesResponse, FileView,
    HealthResponse,
};
use crate::{export, ingest, ws};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, Method},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use ephemeral_registry::{ObjectId, Registry, StoreError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};

/// Shared state for the HTTP server
pub struct ServerState {
    pub registry: Arc<Registry>,
    pub object_ttl: Duration,
    pub max_batch_bytes: u64,
    pub static_dir: Option<PathBuf>,
    pub cors_origins: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(registry: Arc<Registry>, config: &Config) -> Self {
        Self {
            registry,
            object_ttl: config.object_ttl,
            max_batch_bytes: config.max_batch_bytes,
            static_dir: config.static_dir.clone(),
            cors_origins: config.cors_origins.clone(),
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    }
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    let cors = cors_layer(&state.cors_origins);
    let static_dir = state.static_dir.clone();

    let router = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::observe))
        // Files
        .route("/upload", post(ingest::upload))
        .route("/delete-files", post(delete_files))
        .route("/delete-all-files", post(delete_all_files))
        .route("/download-all", get(export::download_all))
        .route("/uploads/{id}", get(get_upload))
        .route("/api/files", get(list_files))
        // The upload gateway enforces its own batch ceiling while streaming
        .layer(DefaultBodyLimit::disable())
        .layer(cors)
        .with_state(state);

    match static_dir {
        Some(dir) => {
            info!(static_dir = ?dir, "Serving static files");
            let index = dir.join("index.html");
            router.fallback_service(ServeDir::new(dir).fallback(ServeFile::new(index)))
        }
        None => router,
    }
}

/// Start the HTTP server and serve until `shutdown` is cancelled
pub async fn start_server(
    state: SharedState,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0) as u64;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: uptime,
        observers: state.registry.observer_count(),
        registry: state.registry.stats().await,
    })
}

async fn list_files(State(state): State<SharedState>) -> Json<Vec<FileView>> {
    Json(file_views(&state.registry.list().await))
}

async fn delete_files(
    State(state): State<SharedState>,
    payload: Result<Json<DeleteFilesRequest>, JsonRejection>,
) -> Result<Json<DeleteFilesResponse>, AppError> {
    let Json(req) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;

    let ids: Vec<ObjectId> = req.file_ids.into_iter().map(ObjectId::from).collect();
    let removed = removal_outcome(state.registry.remove_many(&ids).await)?;
    info!(
        requested = ids.len(),
        removed = removed.len(),
        "Delete request handled"
    );

    Ok(Json(DeleteFilesResponse {
        deleted: removed.iter().map(|id| id.to_string()).collect(),
    }))
}

async fn delete_all_files(
    State(state): State<SharedState>,
) -> Result<Json<DeleteAllResponse>, AppError> {
    let deleted = match state.registry.remove_all().await {
        Ok(records) => records.len(),
        Err(e) => removal_outcome(Err(e))?.len(),
    };
    Ok(Json(DeleteAllResponse { deleted }))
}

/// A durability gap still removed the objects, so the client sees success.
fn removal_outcome(
    result: ephemeral_registry::Result<Vec<ObjectId>>,
) -> Result<Vec<ObjectId>, AppError> {
    match result {
        Ok(removed) => Ok(removed),
        Err(StoreError::DurabilityGap { removed, reason }) => {
            warn!(
                count = removed.len(),
                reason = %reason,
                "Removal succeeded but ledger write failed"
            );
            Ok(removed)
        }
        Err(e) => Err(e.into()),
    }
}

async fn get_upload(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = ObjectId::from(id);
    let (record, reader) = state
        .registry
        .open_content(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("File not found: {}", id)))?;

    let content_type = mime_guess::from_path(&record.display_name)
        .first_or_octet_stream()
        .to_string();
    let disposition = format!(
        "inline; filename*=UTF-8''{}",
        urlencoding::encode(&record.display_name)
    );

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}
