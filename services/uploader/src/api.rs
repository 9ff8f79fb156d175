use crate::capture::{CaptureController, CaptureError};
use crate::config::ApiConfig;
use crate::image_store::{ImageStore, StatusCounts, StoreError};
use crate::progress_bus::ProgressBus;
use crate::record::{ImageRecord, ImageStatus};
use crate::upload_coordinator::{BatchSummary, UploadCoordinator, UploadDispatch, UploadError};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Largest image accepted by `POST /api/v1/images`
const MAX_IMAGE_BYTES: usize = 32 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: ImageStore,
    pub coordinator: UploadCoordinator,
    pub capture: Arc<CaptureController>,
    pub bus: ProgressBus,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "Image not found", "NOT_FOUND"),
        e => {
            error!(error = %e, "Image store error");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "STORE_ERROR")
        }
    }
}

fn upload_error(e: UploadError) -> ApiError {
    match e {
        UploadError::Store(e) => store_error(e),
        e @ UploadError::AlreadyInFlight(_) => {
            api_error(StatusCode::CONFLICT, e.to_string(), "ALREADY_IN_FLIGHT")
        }
        e @ UploadError::NotEligible { .. } => {
            api_error(StatusCode::CONFLICT, e.to_string(), "NOT_ELIGIBLE")
        }
    }
}

fn capture_error(e: CaptureError) -> ApiError {
    match e {
        CaptureError::Unavailable(reason) => {
            api_error(StatusCode::SERVICE_UNAVAILABLE, reason, "CAPTURE_UNAVAILABLE")
        }
        CaptureError::Store(e) => store_error(e),
        e @ CaptureError::Io(_) => {
            error!(error = %e, "Failed to save image");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "CAPTURE_ERROR")
        }
    }
}

/// Query parameters for the image list
#[derive(Debug, Deserialize)]
pub struct ImageListQuery {
    /// Only images in this status
    pub status: Option<ImageStatus>,
}

/// Response to a single upload trigger
#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub id: Uuid,
    pub dispatch: UploadDispatch,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/api/v1/images",
            get(list_images)
                .post(create_image)
                .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES)),
        )
        .route("/api/v1/images/:id", get(get_image))
        .route("/api/v1/images/:id/upload", post(upload_image))
        .route("/api/v1/images/:id/retry", post(retry_image))
        .route("/api/v1/capture", post(capture_image))
        .route("/api/v1/uploads/pending", post(upload_pending))
        .route("/api/v1/uploads/retry-failed", post(retry_failed))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/events", get(events))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "upload-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(state.store.pool()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// List images in capture order
#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
    Query(params): Query<ImageListQuery>,
) -> Result<Json<Vec<ImageRecord>>, ApiError> {
    let images = match params.status {
        Some(status) => state.store.get_by_status(status).await,
        None => state.store.get_all().await,
    }
    .map_err(store_error)?;

    Ok(Json(images))
}

#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ImageRecord>, ApiError> {
    let image = state.store.get_by_id(id).await.map_err(store_error)?;
    Ok(Json(image))
}

/// Register an image captured by the client; the body is the raw image
#[instrument(skip(state, body), fields(size_bytes = body.len()))]
async fn create_image(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<ImageRecord>), ApiError> {
    let record = state
        .capture
        .save(body, Utc::now())
        .await
        .map_err(capture_error)?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// Capture with the configured device
#[instrument(skip(state))]
async fn capture_image(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ImageRecord>), ApiError> {
    let record = state.capture.capture().await.map_err(capture_error)?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[instrument(skip(state))]
async fn upload_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    let dispatch = state.coordinator.request_upload(id).await.map_err(upload_error)?;
    Ok((StatusCode::ACCEPTED, Json(DispatchResponse { id, dispatch })))
}

#[instrument(skip(state))]
async fn retry_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    let dispatch = state.coordinator.retry_one(id).await.map_err(upload_error)?;
    Ok((StatusCode::ACCEPTED, Json(DispatchResponse { id, dispatch })))
}

#[instrument(skip(state))]
async fn upload_pending(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<BatchSummary>), ApiError> {
    let summary = state.coordinator.upload_pending().await.map_err(upload_error)?;
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

#[instrument(skip(state))]
async fn retry_failed(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<BatchSummary>), ApiError> {
    let summary = state.coordinator.retry_all().await.map_err(upload_error)?;
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

/// Per-status image counts
async fn stats(State(state): State<AppState>) -> Result<Json<StatusCounts>, ApiError> {
    let counts = state.store.status_counts().await.map_err(store_error)?;
    Ok(Json(counts))
}

/// Server-sent stream of progress and status events
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(subscribers = state.bus.subscriber_count(), "Event stream client connected");

    let stream = state.bus.subscribe().into_stream().filter_map(|event| async move {
        Event::default()
            .event(event.kind())
            .json_data(&event)
            .ok()
            .map(Ok)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// Start the catalog API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
