//! API Routes

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::detection_log_client::DEFAULT_RECENT_LIMIT;
use crate::error::Result;
use crate::models::{ApiResponse, LimitQuery};
use crate::state::AppState;

/// Upper bound on any `limit` query
const MAX_LIMIT: usize = 100;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Session
        .route("/api/session", get(get_session))
        .route("/api/session/start", post(start_session))
        .route("/api/session/stop", post(stop_session))
        // Alerts (local history)
        .route("/api/alerts", get(list_alerts))
        // Persisted detections
        .route("/api/detections/recent", get(recent_detections))
        .with_state(state)
}

async fn get_session(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.session.snapshot()))
}

async fn start_session(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.session.start().await?;
    Ok(Json(ApiResponse::success(state.session.snapshot())))
}

async fn stop_session(State(state): State<AppState>) -> impl IntoResponse {
    state.session.stop().await;
    Json(ApiResponse::success(state.session.snapshot()))
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(state.config.alert_history)
        .min(MAX_LIMIT);
    Json(ApiResponse::success(state.session.alerts(limit)))
}

async fn recent_detections(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_LIMIT);
    let detections = state.detection_log.recent(limit).await?;
    Ok(Json(ApiResponse::success(detections)))
}
