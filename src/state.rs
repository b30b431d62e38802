//! Application state
//!
//! Holds all shared components and configuration

use crate::ai_client::InferenceClient;
use crate::camera_device::HttpSnapshotCamera;
use crate::camera_session::{CameraSession, MonitorSettings};
use crate::detection_log_client::{AlertStore, HttpDetectionLogClient};
use crate::device_lease::DeviceLeaseManager;
use crate::error::Result;
use crate::frame_sampler::FrameSampler;
use crate::quality_gate::QualityGate;
use crate::scheduler::BackoffKind;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Inference + persistence backend base URL
    pub backend_url: String,
    /// Optional bearer token for the backend
    pub backend_token: Option<String>,
    /// JPEG snapshot source for the camera slot
    pub camera_snapshot_url: String,
    /// Logical camera slot id
    pub camera_slot: String,
    pub sample_period_ms: u64,
    pub save_cooldown_ms: u64,
    /// Local alert history size (K)
    pub alert_history: usize,
    pub sample_edge_px: u32,
    pub jpeg_quality: u8,
    pub quality_dark: f32,
    pub quality_bright: f32,
    pub inference_timeout_ms: u64,
    pub persist_timeout_ms: u64,
    pub failure_backoff: BackoffKind,
    /// Start the session at boot
    pub auto_start: bool,
}

/// Parsed env var, or the default with a warning if it does not parse
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key = %key, value = %raw, "Invalid config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}

impl Default for AppConfig {
    fn default() -> Self {
        let failure_backoff = match std::env::var("FAILURE_BACKOFF") {
            Ok(raw) => BackoffKind::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "Unknown FAILURE_BACKOFF, using none");
                BackoffKind::None
            }),
            Err(_) => BackoffKind::None,
        };

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8080),
            backend_url: std::env::var("BACKEND_URL")
                .unwrap_or_else(|_| "http://localhost:5000/api".to_string()),
            backend_token: std::env::var("BACKEND_TOKEN").ok().filter(|t| !t.is_empty()),
            camera_snapshot_url: std::env::var("CAMERA_SNAPSHOT_URL").unwrap_or_else(|_| {
                "http://localhost:1984/api/frame.jpeg?src=webcam".to_string()
            }),
            camera_slot: std::env::var("CAMERA_SLOT")
                .unwrap_or_else(|_| "local-webcam".to_string()),
            sample_period_ms: env_or("SAMPLE_PERIOD_MS", 1500),
            save_cooldown_ms: env_or("SAVE_COOLDOWN_MS", 3000),
            alert_history: env_or("ALERT_HISTORY", 7),
            sample_edge_px: env_or("SAMPLE_EDGE_PX", 320),
            jpeg_quality: env_or("JPEG_QUALITY", 60),
            quality_dark: env_or("QUALITY_DARK", 40.0),
            quality_bright: env_or("QUALITY_BRIGHT", 220.0),
            inference_timeout_ms: env_or("INFERENCE_TIMEOUT_MS", 5000),
            persist_timeout_ms: env_or("PERSIST_TIMEOUT_MS", 5000),
            failure_backoff,
            auto_start: env_flag("AUTO_START"),
        }
    }
}

impl AppConfig {
    /// Session tunables derived from this config
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            period: Duration::from_millis(self.sample_period_ms.max(1)),
            cooldown_ms: self.save_cooldown_ms,
            history_capacity: self.alert_history.max(1),
            sampler: FrameSampler::new(self.sample_edge_px, self.jpeg_quality),
            gate: QualityGate::with_thresholds(self.quality_dark, self.quality_bright),
            backoff: self.failure_backoff,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// The monitored camera slot
    pub session: Arc<CameraSession>,
    /// Inference backend (health only; ticks hold their own handle)
    pub ai_client: Arc<InferenceClient>,
    /// Persisted detections
    pub detection_log: Arc<dyn AlertStore>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the real components from config
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let ai_client = Arc::new(
            InferenceClient::with_timeout(
                config.backend_url.clone(),
                Duration::from_millis(config.inference_timeout_ms),
            )?
            .with_auth_token(config.backend_token.clone()),
        );

        let detection_log: Arc<dyn AlertStore> = Arc::new(
            HttpDetectionLogClient::with_timeout(
                config.backend_url.clone(),
                Duration::from_millis(config.persist_timeout_ms),
            )?
            .with_auth_token(config.backend_token.clone()),
        );

        let camera = Arc::new(HttpSnapshotCamera::new(
            config.camera_slot.clone(),
            config.camera_snapshot_url.clone(),
        )?);

        let session = Arc::new(CameraSession::new(
            camera,
            Arc::new(DeviceLeaseManager::new()),
            ai_client.clone(),
            detection_log.clone(),
            config.monitor_settings(),
        ));

        Ok(Self {
            config,
            session,
            ai_client,
            detection_log,
            started_at: Instant::now(),
        })
    }
}
