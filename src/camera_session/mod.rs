//! CameraSession - Monitoring Session Lifecycle
//!
//! ## Responsibilities
//!
//! - Own the camera stream and the device lease for one camera slot
//! - Start/stop the sampling scheduler
//! - Run each tick: capture, gate, analyze, update state, offer alerts
//! - Drop results that belong to a superseded session generation
//!
//! ## Concurrency
//!
//! Start and stop are serialized by the lifecycle lock. All state a tick
//! mutates lives in one `Monitor` behind a std mutex; the generation check
//! and the mutation happen under that lock, and the lock is never held
//! across an await.

use crate::ai_client::{DetectionResult, Detector};
use crate::alert_sink::{
    Alert, AlertForwarder, AlertSink, DEFAULT_COOLDOWN_MS, DEFAULT_HISTORY_CAPACITY,
};
use crate::camera_device::{CameraCapability, CameraError, VideoSink, VideoStream};
use crate::detection_log_client::AlertStore;
use crate::detection_state::{DetectionAction, DetectionState, DetectionStateMachine};
use crate::device_lease::{DeviceLease, DeviceLeaseManager};
use crate::error::Result;
use crate::frame_sampler::FrameSampler;
use crate::quality_gate::QualityGate;
use crate::scheduler::{BackoffKind, Scheduler, SchedulerStats, TickOutcome, DEFAULT_PERIOD_MS};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Starting,
    Active,
    Stopping,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Starting => "starting",
            SessionStatus::Active => "active",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Error => "error",
        }
    }
}

/// Tunables for one session
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub period: Duration,
    pub cooldown_ms: u64,
    pub history_capacity: usize,
    pub sampler: FrameSampler,
    pub gate: QualityGate,
    pub backoff: BackoffKind,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(DEFAULT_PERIOD_MS),
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            sampler: FrameSampler::default(),
            gate: QualityGate::default(),
            backoff: BackoffKind::None,
        }
    }
}

/// Everything a tick is allowed to mutate
struct Monitor {
    status: SessionStatus,
    generation: u64,
    detection: DetectionStateMachine,
    alerts: AlertSink,
    last_error: Option<String>,
}

/// Resources held while Active
#[derive(Default)]
struct Lifecycle {
    stream: Option<Arc<dyn VideoStream>>,
    lease: Option<DeviceLease>,
}

/// Scheduler view plus the persistence window
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerState {
    #[serde(flatten)]
    pub stats: SchedulerStats,
    pub cooldown_ms: i64,
    pub last_persist_at: Option<DateTime<Utc>>,
}

/// Read-only view for the UI
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub camera_slot: String,
    pub status: SessionStatus,
    pub generation: u64,
    pub detection_state: DetectionState,
    pub status_text: String,
    pub latest_result: Option<DetectionResult>,
    /// Newest first
    pub alerts: Vec<Alert>,
    pub scheduler: SchedulerState,
    pub last_error: Option<String>,
}

/// One monitored camera slot
pub struct CameraSession {
    camera: Arc<dyn CameraCapability>,
    leases: Arc<DeviceLeaseManager>,
    detector: Arc<dyn Detector>,
    forwarder: AlertForwarder,
    settings: MonitorSettings,
    sink: VideoSink,
    scheduler: Scheduler,
    monitor: Arc<Mutex<Monitor>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl CameraSession {
    pub fn new(
        camera: Arc<dyn CameraCapability>,
        leases: Arc<DeviceLeaseManager>,
        detector: Arc<dyn Detector>,
        store: Arc<dyn AlertStore>,
        settings: MonitorSettings,
    ) -> Self {
        let scheduler = Scheduler::with_backoff(settings.backoff.policy(settings.period));
        let monitor = Monitor {
            status: SessionStatus::Idle,
            generation: 0,
            detection: DetectionStateMachine::new(),
            alerts: AlertSink::new(settings.history_capacity, settings.cooldown_ms),
            last_error: None,
        };

        Self {
            camera,
            leases,
            detector,
            forwarder: AlertForwarder::new(store),
            settings,
            sink: VideoSink::new(),
            scheduler,
            monitor: Arc::new(Mutex::new(monitor)),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        }
    }

    fn monitor(&self) -> MutexGuard<'_, Monitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn camera_slot(&self) -> &str {
        self.camera.slot_id()
    }

    /// Acquire the camera and start sampling.
    ///
    /// No-op while Active or Starting. Resource errors leave the session in
    /// Error and are returned to the caller; nothing is retried.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let slot = self.camera.slot_id().to_string();

        let generation = {
            let mut monitor = self.monitor();
            if matches!(monitor.status, SessionStatus::Active | SessionStatus::Starting) {
                tracing::debug!(camera_slot = %slot, "Session already running");
                return Ok(());
            }
            monitor.generation += 1;
            monitor.status = SessionStatus::Starting;
            monitor.last_error = None;
            monitor.generation
        };

        // Leftovers from a stop that has not finished releasing yet
        Self::release(&mut lifecycle, &self.sink);

        let lease = match self.leases.try_acquire(&slot, generation) {
            Ok(lease) => lease,
            Err(holder) => {
                let err = CameraError::DeviceUnavailable(format!(
                    "camera slot {} is in use by another session (since {})",
                    slot,
                    holder.since.to_rfc3339()
                ));
                return Err(self.fail(generation, err));
            }
        };

        let stream: Arc<dyn VideoStream> = match self.camera.acquire().await {
            Ok(stream) => Arc::from(stream),
            Err(err) => {
                drop(lease);
                return Err(self.fail(generation, err));
            }
        };

        {
            let mut monitor = self.monitor();
            if monitor.generation != generation {
                drop(monitor);
                stream.stop_tracks();
                drop(lease);
                tracing::info!(
                    camera_slot = %slot,
                    generation,
                    "Start superseded by stop, camera released"
                );
                return Ok(());
            }

            self.sink.attach(stream.clone());
            monitor.status = SessionStatus::Active;
            monitor.detection.activate();

            let ctx = TickContext {
                generation,
                monitor: self.monitor.clone(),
                sink: self.sink.clone(),
                sampler: self.settings.sampler.clone(),
                gate: self.settings.gate.clone(),
                detector: self.detector.clone(),
                forwarder: self.forwarder.clone(),
            };
            self.scheduler.start(self.settings.period, move || ctx.clone().run());
        }

        lifecycle.stream = Some(stream);
        lifecycle.lease = Some(lease);

        tracing::info!(camera_slot = %slot, generation, "Monitoring session started");
        Ok(())
    }

    fn fail(&self, generation: u64, err: CameraError) -> crate::error::Error {
        let mut monitor = self.monitor();
        if monitor.generation == generation {
            monitor.status = SessionStatus::Error;
            monitor.last_error = Some(err.to_string());
            monitor.detection.deactivate();
        }
        drop(monitor);

        tracing::warn!(
            camera_slot = %self.camera.slot_id(),
            generation,
            error = %err,
            "Camera acquisition failed"
        );
        err.into()
    }

    /// Stop sampling and release the camera. Safe in any state.
    pub async fn stop(&self) {
        let generation = {
            let mut monitor = self.monitor();
            monitor.generation += 1;
            self.scheduler.stop();
            if monitor.status != SessionStatus::Idle {
                monitor.status = SessionStatus::Stopping;
            }
            monitor.detection.deactivate();
            monitor.generation
        };

        let mut lifecycle = self.lifecycle.lock().await;
        Self::release(&mut lifecycle, &self.sink);

        let mut monitor = self.monitor();
        if monitor.generation == generation {
            monitor.status = SessionStatus::Idle;
        }
        drop(monitor);

        tracing::info!(
            camera_slot = %self.camera.slot_id(),
            generation,
            "Monitoring session stopped"
        );
    }

    fn release(lifecycle: &mut Lifecycle, sink: &VideoSink) {
        if let Some(stream) = lifecycle.stream.take() {
            stream.stop_tracks();
        }
        sink.detach();
        lifecycle.lease.take();
    }

    pub fn status(&self) -> SessionStatus {
        self.monitor().status
    }

    pub fn generation(&self) -> u64 {
        self.monitor().generation
    }

    pub fn is_analyzing(&self) -> bool {
        self.scheduler.is_analyzing()
    }

    /// Local alert history, newest first
    pub fn alerts(&self, limit: usize) -> Vec<Alert> {
        self.monitor().alerts.history().latest(limit)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let stats = self.scheduler.stats();
        let monitor = self.monitor();

        SessionSnapshot {
            camera_slot: self.camera.slot_id().to_string(),
            status: monitor.status,
            generation: monitor.generation,
            detection_state: monitor.detection.state(),
            status_text: monitor.detection.status_text(),
            latest_result: monitor.detection.latest_result().cloned(),
            alerts: monitor.alerts.history().latest(monitor.alerts.history().capacity()),
            scheduler: SchedulerState {
                stats,
                cooldown_ms: monitor.alerts.cooldown_ms(),
                last_persist_at: monitor.alerts.last_persist_at(),
            },
            last_error: monitor.last_error.clone(),
        }
    }
}

/// Per-generation tick state
#[derive(Clone)]
struct TickContext {
    generation: u64,
    monitor: Arc<Mutex<Monitor>>,
    sink: VideoSink,
    sampler: FrameSampler,
    gate: QualityGate,
    detector: Arc<dyn Detector>,
    forwarder: AlertForwarder,
}

impl TickContext {
    /// Run `f` on the monitor unless this generation has been superseded
    fn apply<R>(&self, f: impl FnOnce(&mut Monitor) -> R) -> Option<R> {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.generation != self.generation {
            tracing::trace!(
                generation = self.generation,
                current = monitor.generation,
                "Dropping work from superseded session"
            );
            return None;
        }
        Some(f(&mut monitor))
    }

    async fn run(self) -> TickOutcome {
        if self.apply(|m| m.detection.begin_tick()).is_none() {
            return TickOutcome::Superseded;
        }

        let sample = match self.sampler.capture(&self.sink).await {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(generation = self.generation, error = %e, "Frame capture failed");
                return TickOutcome::CaptureFailed;
            }
        };

        let verdict = self.gate.evaluate(&sample);
        if !verdict.passed() {
            tracing::debug!(
                generation = self.generation,
                ?verdict,
                "Frame rejected by quality gate"
            );
            return TickOutcome::QualityRejected;
        }

        if self.apply(|m| m.detection.analysis_started()) != Some(true) {
            return TickOutcome::Superseded;
        }

        let result = self.detector.analyze(&sample).await;
        let outcome = if result.failed {
            TickOutcome::InferenceFailed
        } else {
            TickOutcome::Analyzed { threat: result.threat_present }
        };

        let image = sample.bytes;
        let applied = self.apply(move |m| match m.detection.apply_result(result.clone()) {
            DetectionAction::RaiseAlert => Some(m.alerts.offer(Alert::new(result, image))),
            DetectionAction::None => None,
        });

        match applied {
            None => TickOutcome::Superseded,
            Some(Some(alert)) => {
                tracing::info!(
                    generation = self.generation,
                    alert_id = %alert.id,
                    persisted = alert.persisted,
                    status = %alert.result.status_text(),
                    "Threat detected"
                );
                if alert.persisted {
                    self.forwarder.forward(&alert);
                }
                outcome
            }
            Some(None) => outcome,
        }
    }
}
