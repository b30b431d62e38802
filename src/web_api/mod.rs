//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - Session status and lifecycle controls
//! - Alert history and persisted detections
//! - Response formatting

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let inference_ok = state.ai_client.health_check().await;

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        inference_connected: inference_ok,
        session_status: state.session.status().as_str().to_string(),
    };

    Json(response)
}
