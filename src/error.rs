//! Error handling for CamWatch Monitor

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::camera_device::CameraError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Camera resource error (permission / device)
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// Frame capture failed on an acquired stream
    #[error("Capture error: {0}")]
    Capture(String),

    /// Image decode/encode error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status or `success: false`
    #[error("API error: {0}")]
    Api(String),

    /// Backend payload did not match the expected shape
    #[error("Parse error: {0}")]
    Parse(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::Camera(CameraError::PermissionDenied(_)) => (
                StatusCode::FORBIDDEN,
                "CAMERA_PERMISSION_DENIED",
                self.to_string(),
            ),
            Error::Camera(CameraError::DeviceUnavailable(_)) => (
                StatusCode::CONFLICT,
                "CAMERA_UNAVAILABLE",
                self.to_string(),
            ),
            Error::Capture(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CAPTURE_ERROR",
                msg.clone(),
            ),
            Error::Image(e) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "IMAGE_ERROR",
                e.to_string(),
            ),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR", e.to_string()),
            Error::Api(msg) => (StatusCode::BAD_GATEWAY, "API_ERROR", msg.clone()),
            Error::Parse(msg) => (StatusCode::BAD_GATEWAY, "PARSE_ERROR", msg.clone()),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
