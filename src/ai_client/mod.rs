//! AIClient - Inference Endpoint Adapter
//!
//! ## Responsibilities
//!
//! - Send one encoded frame per request to the detection endpoint
//! - Parse the weapon detection response
//! - Fold every failure (transport, status, payload) into a failed DetectionResult
//! - Health check

use crate::error::{Error, Result};
use crate::frame_sampler::FrameSample;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bound on a single analyze exchange
pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// One detected object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedItem {
    pub label: String,
    /// 0..1
    pub confidence: f32,
}

/// Outcome of one analyze call
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub threat_present: bool,
    pub items: Vec<DetectedItem>,
    /// 0..1
    pub overall_confidence: f32,
    pub received_at: DateTime<Utc>,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Backend says it stored this frame itself
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_by_server: Option<bool>,
    /// Backend's remaining save cooldown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_save_in_ms: Option<u64>,
}

impl DetectionResult {
    /// Non-threat result
    pub fn clear(received_at: DateTime<Utc>) -> Self {
        Self {
            threat_present: false,
            items: Vec::new(),
            overall_confidence: 0.0,
            received_at,
            failed: false,
            failure_reason: None,
            saved_by_server: None,
            next_save_in_ms: None,
        }
    }

    /// Threat result with the given items
    pub fn threat(
        items: Vec<DetectedItem>,
        overall_confidence: f32,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            threat_present: true,
            items,
            overall_confidence: overall_confidence.clamp(0.0, 1.0),
            ..Self::clear(received_at)
        }
    }

    /// "Detection unavailable" marker
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            failed: true,
            failure_reason: Some(reason.into()),
            ..Self::clear(Utc::now())
        }
    }

    /// Short text for the UI status line
    pub fn status_text(&self) -> String {
        if self.failed {
            return "Detection unavailable".to_string();
        }
        if !self.threat_present {
            return "No weapons detected".to_string();
        }

        let labels: Vec<&str> = self.items.iter().map(|i| i.label.as_str()).collect();
        format!(
            "WEAPON DETECTED: {} ({:.0}%)",
            labels.join(", "),
            self.overall_confidence * 100.0
        )
    }
}

/// Weapon entry as the backend reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeaponEntry {
    pub weapon: String,
    pub confidence: f32,
}

impl From<&DetectedItem> for WeaponEntry {
    fn from(item: &DetectedItem) -> Self {
        Self {
            weapon: item.label.clone(),
            confidence: item.confidence,
        }
    }
}

/// Analyze request body
#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    image_b64: &'a str,
}

/// Analyze response (matches /dashboard/analyze-frame)
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeResponse {
    pub success: bool,

    #[serde(default)]
    pub weapon_detected: bool,

    #[serde(default)]
    pub weapons: Vec<WeaponEntry>,

    #[serde(default)]
    pub confidence: f32,

    #[serde(default)]
    pub saved_to_recent: Option<bool>,

    /// Seconds
    #[serde(default)]
    pub time_until_next_save: Option<f64>,

    #[serde(default)]
    pub message: Option<String>,
}

impl AnalyzeResponse {
    /// Convert a successful response into a DetectionResult
    pub fn into_result(self, received_at: DateTime<Utc>) -> DetectionResult {
        let items: Vec<DetectedItem> = self
            .weapons
            .into_iter()
            .map(|w| DetectedItem {
                label: w.weapon,
                confidence: w.confidence.clamp(0.0, 1.0),
            })
            .collect();

        let next_save_in_ms = self
            .time_until_next_save
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| (secs * 1000.0).round() as u64);

        DetectionResult {
            threat_present: self.weapon_detected,
            items,
            overall_confidence: self.confidence.clamp(0.0, 1.0),
            received_at,
            failed: false,
            failure_reason: None,
            saved_by_server: self.saved_to_recent,
            next_save_in_ms,
        }
    }
}

/// Seam between the scheduler and whatever answers "is there a threat in this frame"
#[async_trait]
pub trait Detector: Send + Sync {
    /// Never fails: errors come back as `DetectionResult::unavailable`
    async fn analyze(&self, sample: &FrameSample) -> DetectionResult;
}

/// HTTP inference client
pub struct InferenceClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    auth_token: Option<String>,
}

impl InferenceClient {
    /// Create new client with default timeout
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_INFERENCE_TIMEOUT)
    }

    /// Create new client with custom timeout
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            auth_token: None,
        })
    }

    /// Forward a bearer token with every request
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    /// Check backend health
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.authorized(self.client.get(&url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// One analyze exchange, errors propagated
    pub async fn try_analyze(&self, sample: &FrameSample) -> Result<DetectionResult> {
        let url = format!("{}/dashboard/analyze-frame", self.base_url);
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(&sample.bytes);

        let resp = self
            .authorized(self.client.post(&url))
            .json(&AnalyzeRequest { image_b64: &image_b64 })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api(format!(
                "analyze-frame failed: {} - {}",
                status, body
            )));
        }

        let body = resp.text().await?;
        let parsed: AnalyzeResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Parse(format!("analyze-frame payload: {}", e)))?;

        if !parsed.success {
            return Err(Error::Api(
                parsed
                    .message
                    .unwrap_or_else(|| "analyze-frame reported failure".to_string()),
            ));
        }

        Ok(parsed.into_result(Utc::now()))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Detector for InferenceClient {
    async fn analyze(&self, sample: &FrameSample) -> DetectionResult {
        match self.try_analyze(sample).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    timeout_ms = crate::scheduler::millis(self.timeout),
                    "Inference unavailable for this frame"
                );
                DetectionResult::unavailable(e.to_string())
            }
        }
    }
}
