//! CameraDevice - Camera Capability Abstraction
//!
//! ## Responsibilities
//!
//! - Acquire a live video stream from a camera slot
//! - Stop all tracks of a stream on release
//! - Hold the currently attached stream for frame sampling (VideoSink)
//! - HTTP snapshot backed camera (IP camera / go2rtc frame.jpeg)

use crate::error::{Error, Result};
use async_trait::async_trait;
use image::DynamicImage;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Resource errors raised while acquiring a camera.
///
/// Both are fatal to the session until the user retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CameraError {
    /// The user or the device refused access
    #[error("Camera permission denied: {0}")]
    PermissionDenied(String),
    /// No device, device busy, or device not responding
    #[error("Camera device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Something that can hand out a live video stream
#[async_trait]
pub trait CameraCapability: Send + Sync {
    /// Logical camera slot this capability controls
    fn slot_id(&self) -> &str;

    /// Acquire a live stream
    async fn acquire(&self) -> std::result::Result<Box<dyn VideoStream>, CameraError>;
}

/// A live stream owned by exactly one session
#[async_trait]
pub trait VideoStream: Send + Sync {
    /// Current frame of the stream
    async fn current_frame(&self) -> Result<DynamicImage>;

    /// Stop all tracks; the stream is dead afterwards
    fn stop_tracks(&self);

    /// Whether the tracks are still running
    fn is_live(&self) -> bool;
}

/// Slot the sampler reads frames from
///
/// The session attaches its stream on start and detaches it on stop.
#[derive(Clone, Default)]
pub struct VideoSink {
    stream: Arc<RwLock<Option<Arc<dyn VideoStream>>>>,
}

impl VideoSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a stream, replacing any previous one
    pub fn attach(&self, stream: Arc<dyn VideoStream>) {
        let mut slot = self.stream.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(stream);
    }

    /// Detach the current stream, if any
    pub fn detach(&self) -> Option<Arc<dyn VideoStream>> {
        let mut slot = self.stream.write().unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }

    /// Currently attached stream
    pub fn current(&self) -> Option<Arc<dyn VideoStream>> {
        self.stream
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_attached(&self) -> bool {
        self.current().is_some()
    }
}

/// Camera reached through an HTTP snapshot URL
pub struct HttpSnapshotCamera {
    client: reqwest::Client,
    slot_id: String,
    snapshot_url: String,
}

impl HttpSnapshotCamera {
    /// Create camera with default 5s request timeout
    pub fn new(slot_id: impl Into<String>, snapshot_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(slot_id, snapshot_url, Duration::from_secs(5))
    }

    /// Create camera with custom request timeout
    pub fn with_timeout(
        slot_id: impl Into<String>,
        snapshot_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            slot_id: slot_id.into(),
            snapshot_url: snapshot_url.into(),
        })
    }

    pub fn snapshot_url(&self) -> &str {
        &self.snapshot_url
    }
}

#[async_trait]
impl CameraCapability for HttpSnapshotCamera {
    fn slot_id(&self) -> &str {
        &self.slot_id
    }

    async fn acquire(&self) -> std::result::Result<Box<dyn VideoStream>, CameraError> {
        // Probe once so permission and reachability failures surface at start
        let resp = self
            .client
            .get(&self.snapshot_url)
            .send()
            .await
            .map_err(|e| CameraError::DeviceUnavailable(e.to_string()))?;

        match resp.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(CameraError::PermissionDenied(format!(
                    "snapshot endpoint answered {}",
                    resp.status()
                )));
            }
            status => {
                return Err(CameraError::DeviceUnavailable(format!(
                    "snapshot endpoint answered {}",
                    status
                )));
            }
        }

        tracing::info!(
            camera_slot = %self.slot_id,
            url = %self.snapshot_url,
            "Camera stream acquired"
        );

        Ok(Box::new(HttpSnapshotStream {
            client: self.client.clone(),
            slot_id: self.slot_id.clone(),
            snapshot_url: self.snapshot_url.clone(),
            live: AtomicBool::new(true),
        }))
    }
}

/// Stream over an HTTP snapshot URL; each frame is one GET
struct HttpSnapshotStream {
    client: reqwest::Client,
    slot_id: String,
    snapshot_url: String,
    live: AtomicBool,
}

#[async_trait]
impl VideoStream for HttpSnapshotStream {
    async fn current_frame(&self) -> Result<DynamicImage> {
        if !self.is_live() {
            return Err(Error::Capture(format!(
                "stream for {} has been stopped",
                self.slot_id
            )));
        }

        let resp = self.client.get(&self.snapshot_url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Capture(format!(
                "snapshot fetch failed: {}",
                resp.status()
            )));
        }

        let bytes = resp.bytes().await?;
        let frame = image::load_from_memory(&bytes)?;
        Ok(frame)
    }

    fn stop_tracks(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            tracing::debug!(camera_slot = %self.slot_id, "Stream tracks stopped");
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}
