//! HTTP inspection API
//!
//! Read-only views of the running coordinator:
//! - `GET /health` - liveness
//! - `GET /api/rooms` - one summary per room
//! - `GET /api/rooms/:id` - room detail with a freshly stamped snapshot
//! - `GET /api/metrics` - coordinator counters

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cosync_core::{CoordinatorHandle, MetricsSnapshot};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,
}

impl AppState {
    pub fn new(coordinator: CoordinatorHandle) -> Self {
        Self { coordinator }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: &str, message: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message,
        }),
    )
        .into_response()
}

fn unavailable(err: cosync_core::Error) -> Response {
    warn!("Inspection query failed: {}", err);
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "coordinator_unavailable",
        err.to_string(),
    )
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/rooms", get(list_rooms))
        .route("/api/rooms/:id", get(get_room))
        .route("/api/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_rooms(State(state): State<AppState>) -> Response {
    match state.coordinator.rooms().await {
        Ok(rooms) => Json(rooms).into_response(),
        Err(e) => unavailable(e),
    }
}

async fn get_room(State(state): State<AppState>, Path(room_id): Path<String>) -> Response {
    match state.coordinator.room(room_id.clone()).await {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "room_not_found",
            format!("Room {} not found", room_id),
        ),
        Err(e) => unavailable(e),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.coordinator.metrics().snapshot())
}
