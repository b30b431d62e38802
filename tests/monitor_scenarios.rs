//! End-to-end session scenarios against in-process fakes
//!
//! All tests run on tokio's paused clock, so "sleep 1500ms" is exact and instant.

use async_trait::async_trait;
use camwatch_monitor::ai_client::{DetectedItem, DetectionResult, Detector};
use camwatch_monitor::camera_device::{CameraCapability, CameraError, VideoStream};
use camwatch_monitor::camera_session::{CameraSession, MonitorSettings, SessionStatus};
use camwatch_monitor::detection_log_client::{
    AlertStore, NewDetectionRecord, RecordId, StoredDetection,
};
use camwatch_monitor::detection_state::DetectionState;
use camwatch_monitor::device_lease::DeviceLeaseManager;
use camwatch_monitor::frame_sampler::FrameSample;
use camwatch_monitor::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use image::{DynamicImage, ImageBuffer, Rgb};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;

const PERIOD_MS: u64 = 1500;

fn t0() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_760_000_000_000).unwrap()
}

// ---------------------------------------------------------------- camera

struct FakeStream {
    live: Arc<AtomicBool>,
    lumas: Arc<Mutex<VecDeque<u8>>>,
}

#[async_trait]
impl VideoStream for FakeStream {
    async fn current_frame(&self) -> Result<DynamicImage> {
        if !self.is_live() {
            return Err(Error::Capture("stream stopped".to_string()));
        }
        let luma = self.lumas.lock().unwrap().pop_front().unwrap_or(128);
        Ok(DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
            640,
            480,
            Rgb([luma, luma, luma]),
        )))
    }

    fn stop_tracks(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

struct FakeCamera {
    slot: String,
    deny: Option<CameraError>,
    lumas: Arc<Mutex<VecDeque<u8>>>,
    streams: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeCamera {
    fn new(slot: &str) -> Self {
        Self {
            slot: slot.to_string(),
            deny: None,
            lumas: Arc::new(Mutex::new(VecDeque::new())),
            streams: Mutex::new(Vec::new()),
        }
    }

    fn denying(slot: &str, err: CameraError) -> Self {
        Self {
            deny: Some(err),
            ..Self::new(slot)
        }
    }

    fn script_lumas(&self, lumas: &[u8]) {
        self.lumas.lock().unwrap().extend(lumas.iter().copied());
    }

    fn live_streams(&self) -> usize {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .filter(|live| live.load(Ordering::SeqCst))
            .count()
    }

    fn acquired(&self) -> usize {
        self.streams.lock().unwrap().len()
    }
}

#[async_trait]
impl CameraCapability for FakeCamera {
    fn slot_id(&self) -> &str {
        &self.slot
    }

    async fn acquire(&self) -> std::result::Result<Box<dyn VideoStream>, CameraError> {
        if let Some(err) = &self.deny {
            return Err(err.clone());
        }
        let live = Arc::new(AtomicBool::new(true));
        self.streams.lock().unwrap().push(live.clone());
        Ok(Box::new(FakeStream {
            live,
            lumas: self.lumas.clone(),
        }))
    }
}

// -------------------------------------------------------------- detector

enum Step {
    Clear,
    Threat {
        label: &'static str,
        confidence: f32,
        at_ms: i64,
    },
    Fail,
    Delayed(Duration, Box<Step>),
    Blocked(Arc<Notify>, Box<Step>),
}

impl Step {
    fn threat(at_ms: i64) -> Self {
        Step::Threat {
            label: "knife",
            confidence: 0.91,
            at_ms,
        }
    }

    fn resolve(&self) -> DetectionResult {
        match self {
            Step::Clear => DetectionResult::clear(Utc::now()),
            Step::Threat {
                label,
                confidence,
                at_ms,
            } => DetectionResult::threat(
                vec![DetectedItem {
                    label: label.to_string(),
                    confidence: *confidence,
                }],
                *confidence,
                t0() + chrono::Duration::milliseconds(*at_ms),
            ),
            Step::Fail => DetectionResult::unavailable("request timed out"),
            Step::Delayed(_, inner) | Step::Blocked(_, inner) => inner.resolve(),
        }
    }
}

#[derive(Default)]
struct FakeDetector {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeDetector {
    fn scripted(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for FakeDetector {
    async fn analyze(&self, sample: &FrameSample) -> DetectionResult {
        assert!(!sample.bytes.is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Clear);
        match &step {
            Step::Delayed(delay, _) => sleep(*delay).await,
            Step::Blocked(notify, _) => notify.notified().await,
            _ => {}
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        step.resolve()
    }
}

// ----------------------------------------------------------------- store

struct FakeStore {
    tx: mpsc::UnboundedSender<NewDetectionRecord>,
}

#[async_trait]
impl AlertStore for FakeStore {
    async fn save(&self, record: &NewDetectionRecord) -> Result<RecordId> {
        let _ = self.tx.send(record.clone());
        Ok(RecordId::Number(1))
    }

    async fn recent(&self, _limit: usize) -> Result<Vec<StoredDetection>> {
        Ok(Vec::new())
    }
}

// --------------------------------------------------------------- harness

struct Harness {
    session: CameraSession,
    camera: Arc<FakeCamera>,
    detector: Arc<FakeDetector>,
    records: mpsc::UnboundedReceiver<NewDetectionRecord>,
}

fn settings() -> MonitorSettings {
    MonitorSettings {
        period: Duration::from_millis(PERIOD_MS),
        cooldown_ms: 3000,
        history_capacity: 7,
        ..MonitorSettings::default()
    }
}

fn harness_with(
    camera: FakeCamera,
    steps: Vec<Step>,
    leases: Arc<DeviceLeaseManager>,
) -> Harness {
    let camera = Arc::new(camera);
    let detector = Arc::new(FakeDetector::scripted(steps));
    let (tx, records) = mpsc::unbounded_channel();

    let session = CameraSession::new(
        camera.clone(),
        leases,
        detector.clone(),
        Arc::new(FakeStore { tx }),
        settings(),
    );

    Harness {
        session,
        camera,
        detector,
        records,
    }
}

fn harness(steps: Vec<Step>) -> Harness {
    harness_with(
        FakeCamera::new("webcam"),
        steps,
        Arc::new(DeviceLeaseManager::new()),
    )
}

/// Let the immediate first tick run to completion
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

async fn next_tick() {
    sleep(Duration::from_millis(PERIOD_MS)).await;
}

// ----------------------------------------------------------------- tests

#[tokio::test(start_paused = true)]
async fn no_threat_leaves_history_untouched() {
    let mut h = harness(vec![Step::Clear]);
    h.session.start().await.unwrap();
    settle().await;

    let snapshot = h.session.snapshot();
    assert_eq!(h.detector.calls(), 1);
    assert_eq!(snapshot.status, SessionStatus::Active);
    assert_eq!(snapshot.detection_state, DetectionState::Ready);
    assert!(snapshot.alerts.is_empty());
    assert!(h.records.try_recv().is_err());

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn threats_within_cooldown_persist_once() {
    let mut h = harness(vec![Step::threat(0), Step::threat(1000)]);
    h.session.start().await.unwrap();
    settle().await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.detection_state, DetectionState::ThreatActive);
    assert_eq!(snapshot.alerts.len(), 1);
    assert!(snapshot.alerts[0].persisted);
    assert_eq!(snapshot.status_text, "WEAPON DETECTED: knife (91%)");

    let record = h.records.recv().await.unwrap();
    assert_eq!(record.weapons[0].weapon, "knife");
    assert_eq!(record.detected_at, t0());

    next_tick().await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.detection_state, DetectionState::ThreatActive);
    assert_eq!(snapshot.alerts.len(), 2);
    assert!(!snapshot.alerts[0].persisted);
    assert!(snapshot.alerts[1].persisted);
    assert!(h.records.try_recv().is_err());
    assert_eq!(snapshot.scheduler.last_persist_at, Some(t0()));

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn threat_decays_on_next_tick() {
    let h = harness(vec![Step::threat(0), Step::Clear]);
    h.session.start().await.unwrap();
    settle().await;
    assert_eq!(h.session.snapshot().detection_state, DetectionState::ThreatActive);

    next_tick().await;
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.detection_state, DetectionState::Ready);
    assert_eq!(snapshot.alerts.len(), 1);

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn inference_timeout_is_transient() {
    let h = harness(vec![
        Step::Delayed(Duration::from_millis(5000), Box::new(Step::Fail)),
        Step::Clear,
    ]);
    h.session.start().await.unwrap();
    settle().await;
    assert!(h.session.is_analyzing());
    assert_eq!(h.session.snapshot().detection_state, DetectionState::Analyzing);

    // Ticks at 1500/3000/4500 find the analysis still in flight
    sleep(Duration::from_millis(5000)).await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.detection_state, DetectionState::Ready);
    assert_eq!(snapshot.status_text, "Detection unavailable");
    assert!(snapshot.latest_result.as_ref().unwrap().failed);
    assert!(!h.session.is_analyzing());
    assert_eq!(snapshot.scheduler.stats.ticks_skipped_busy, 3);
    assert_eq!(h.detector.calls(), 1);

    // Cadence unaffected: the 6000 tick proceeds
    sleep(Duration::from_millis(1000)).await;
    assert_eq!(h.detector.calls(), 2);
    assert_eq!(h.detector.max_in_flight(), 1);
    assert_eq!(h.session.snapshot().status_text, "No weapons detected");

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dark_frames_never_reach_inference() {
    let h = harness(vec![]);
    h.camera.script_lumas(&[5, 5, 5]);
    h.session.start().await.unwrap();

    settle().await;
    assert_eq!(h.detector.calls(), 0);

    sleep(Duration::from_millis(3000)).await;
    assert_eq!(h.detector.calls(), 0);
    assert_eq!(h.session.snapshot().detection_state, DetectionState::Ready);

    next_tick().await;
    assert_eq!(h.detector.calls(), 1);

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stale_result_after_stop_is_dropped() {
    let release = Arc::new(Notify::new());
    let mut h = harness(vec![Step::Blocked(release.clone(), Box::new(Step::threat(0)))]);

    h.session.start().await.unwrap();
    settle().await;
    assert!(h.session.is_analyzing());

    h.session.stop().await;
    release.notify_one();
    settle().await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Idle);
    assert_eq!(snapshot.detection_state, DetectionState::Idle);
    assert!(snapshot.alerts.is_empty());
    assert!(snapshot.latest_result.is_none());
    assert!(h.records.try_recv().is_err());
    assert!(!h.session.is_analyzing());
}

#[tokio::test(start_paused = true)]
async fn restart_waits_for_old_analysis() {
    let release = Arc::new(Notify::new());
    let h = harness(vec![
        Step::Blocked(release.clone(), Box::new(Step::threat(0))),
        Step::Clear,
    ]);

    h.session.start().await.unwrap();
    settle().await;
    h.session.stop().await;
    h.session.start().await.unwrap();
    settle().await;

    // Old generation still holds the in-flight slot
    assert_eq!(h.detector.calls(), 1);

    release.notify_one();
    next_tick().await;

    assert_eq!(h.detector.calls(), 2);
    assert_eq!(h.detector.max_in_flight(), 1);
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.generation, 3);
    assert!(snapshot.alerts.is_empty());

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn history_is_bounded() {
    let steps = (0..10).map(|i| Step::threat(i * 1500)).collect();
    let h = harness(steps);

    h.session.start().await.unwrap();
    settle().await;
    sleep(Duration::from_millis(9 * PERIOD_MS)).await;

    assert_eq!(h.detector.calls(), 10);
    let alerts = h.session.alerts(100);
    assert_eq!(alerts.len(), 7);
    // Newest first
    assert_eq!(alerts[0].created_at, t0() + chrono::Duration::milliseconds(9 * 1500));
    assert_eq!(alerts[6].created_at, t0() + chrono::Duration::milliseconds(3 * 1500));

    h.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_releases_camera_tracks() {
    let h = harness(vec![]);
    h.session.start().await.unwrap();
    settle().await;
    assert_eq!(h.camera.live_streams(), 1);

    h.session.stop().await;
    assert_eq!(h.camera.live_streams(), 0);
    assert_eq!(h.camera.acquired(), 1);

    let calls = h.detector.calls();
    sleep(Duration::from_millis(5 * PERIOD_MS)).await;
    assert_eq!(h.detector.calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn permission_denied_sets_error_and_allows_retry_elsewhere() {
    let leases = Arc::new(DeviceLeaseManager::new());
    let denied = harness_with(
        FakeCamera::denying("webcam", CameraError::PermissionDenied("blocked".to_string())),
        vec![],
        leases.clone(),
    );

    let err = denied.session.start().await.unwrap_err();
    assert!(matches!(err, Error::Camera(CameraError::PermissionDenied(_))));
    let snapshot = denied.session.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Error);
    assert!(snapshot.last_error.unwrap().contains("blocked"));
    assert_eq!(denied.detector.calls(), 0);

    // The failed start did not keep the slot leased
    let other = harness_with(FakeCamera::new("webcam"), vec![], leases);
    other.session.start().await.unwrap();
    assert_eq!(other.session.status(), SessionStatus::Active);
    other.session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn one_session_per_camera_slot() {
    let leases = Arc::new(DeviceLeaseManager::new());
    let first = harness_with(FakeCamera::new("webcam"), vec![], leases.clone());
    let second = harness_with(FakeCamera::new("webcam"), vec![], leases.clone());

    first.session.start().await.unwrap();
    let holder = leases.holder("webcam").unwrap();
    assert_eq!(holder.generation, first.session.generation());

    let err = second.session.start().await.unwrap_err();
    assert!(matches!(err, Error::Camera(CameraError::DeviceUnavailable(_))));
    assert_eq!(second.session.status(), SessionStatus::Error);
    assert_eq!(second.camera.acquired(), 0);

    first.session.stop().await;
    second.session.start().await.unwrap();
    assert_eq!(second.session.status(), SessionStatus::Active);
    assert_eq!(
        leases.holder("webcam").map(|h| h.generation),
        Some(second.session.generation())
    );
    second.session.stop().await;
    assert!(leases.holder("webcam").is_none());
}

#[tokio::test(start_paused = true)]
async fn rapid_toggling_ends_consistent() {
    let h = harness(vec![]);
    for _ in 0..5 {
        h.session.start().await.unwrap();
        h.session.stop().await;
    }
    h.session.start().await.unwrap();
    settle().await;

    assert_eq!(h.session.status(), SessionStatus::Active);
    assert_eq!(h.camera.live_streams(), 1);
    assert_eq!(h.camera.acquired(), 6);

    h.session.stop().await;
    assert_eq!(h.camera.live_streams(), 0);
}
