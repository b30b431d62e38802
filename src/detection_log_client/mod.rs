//! DetectionLogClient - Persisted Detection Records
//!
//! ## Responsibilities
//!
//! - Write one detection record (image + weapons + confidence)
//! - Read the most recent N records for the dashboard strip
//!
//! The backend owns the schema; this side only knows the two calls.

use crate::ai_client::WeaponEntry;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

/// Default bound on a persistence call
pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Dashboard shows this many by default
pub const DEFAULT_RECENT_LIMIT: usize = 10;

/// Record identifier; the backend hands out either integers or strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Number(n) => write!(f, "{}", n),
            RecordId::Text(s) => f.write_str(s),
        }
    }
}

/// Record sent on save
#[derive(Debug, Clone, Serialize)]
pub struct NewDetectionRecord {
    /// Base64 JPEG
    pub image: String,
    pub weapons: Vec<WeaponEntry>,
    pub confidence: f32,
    pub detected_at: DateTime<Utc>,
}

/// Record as read back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDetection {
    pub id: RecordId,
    #[serde(default)]
    pub weapons: Vec<WeaponEntry>,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default, alias = "image_path")]
    pub image_url: Option<String>,
    /// Single-label records written by older backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_type: Option<String>,
    #[serde(deserialize_with = "deserialize_detected_at")]
    pub detected_at: DateTime<Utc>,
}

/// RFC 3339, or a naive ISO timestamp taken as UTC
fn parse_detected_at(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn deserialize_detected_at<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_detected_at(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid detected_at: {}", raw)))
}

#[derive(Debug, Deserialize)]
struct SaveResponse {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default, alias = "detection_id")]
    id: Option<RecordId>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecentResponse {
    success: bool,
    #[serde(default, alias = "data")]
    detections: Vec<StoredDetection>,
    #[serde(default)]
    message: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Where persisted alerts go
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn save(&self, record: &NewDetectionRecord) -> Result<RecordId>;

    /// Newest first
    async fn recent(&self, limit: usize) -> Result<Vec<StoredDetection>>;
}

/// HTTP implementation against the dashboard backend
pub struct HttpDetectionLogClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpDetectionLogClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_PERSIST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl AlertStore for HttpDetectionLogClient {
    async fn save(&self, record: &NewDetectionRecord) -> Result<RecordId> {
        let url = format!("{}/dashboard/detections", self.base_url);

        let resp = self
            .authorized(self.client.post(&url))
            .json(record)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api(format!("save detection failed: {} - {}", status, body)));
        }

        let body = resp.text().await?;
        let parsed: SaveResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Parse(format!("save detection payload: {}", e)))?;

        if !parsed.success {
            return Err(Error::Api(
                parsed.message.unwrap_or_else(|| "save detection reported failure".to_string()),
            ));
        }

        parsed
            .id
            .ok_or_else(|| Error::Parse("save detection response has no id".to_string()))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredDetection>> {
        let url = format!("{}/dashboard/recent-detections", self.base_url);

        let resp = self
            .authorized(self.client.get(&url))
            .query(&[("limit", limit)])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api(format!("recent detections failed: {} - {}", status, body)));
        }

        let body = resp.text().await?;
        let parsed: RecentResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Parse(format!("recent detections payload: {}", e)))?;

        if !parsed.success {
            return Err(Error::Api(
                parsed.message.unwrap_or_else(|| "recent detections reported failure".to_string()),
            ));
        }

        let mut detections = parsed.detections;
        detections.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        detections.truncate(limit);
        Ok(detections)
    }
}
