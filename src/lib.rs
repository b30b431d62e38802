//! CamWatch Monitor Library
//!
//! Real-time weapon detection client for one camera slot.
//!
//! ## Architecture
//!
//! 1. CameraDevice - Camera capability, live stream, video sink
//! 2. DeviceLease - Exclusive access per camera slot
//! 3. FrameSampler - Still frame capture and JPEG encoding
//! 4. QualityGate - Local dark/bright/small frame filter
//! 5. AIClient - Inference endpoint adapter
//! 6. Scheduler - Sampling cadence, one analysis in flight
//! 7. DetectionState - Idle/Ready/Analyzing/ThreatActive machine
//! 8. AlertSink - Cooldown suppression and bounded alert history
//! 9. DetectionLogClient - Persisted detection records
//! 10. CameraSession - Lifecycle and per-tick composition
//! 11. WebAPI - REST API endpoints
//!
//! ## Flow
//!
//! start -> lease + stream -> tick: capture -> gate -> analyze -> state -> alert -> persist

pub mod ai_client;
pub mod alert_sink;
pub mod camera_device;
pub mod camera_session;
pub mod detection_log_client;
pub mod detection_state;
pub mod device_lease;
pub mod error;
pub mod frame_sampler;
pub mod models;
pub mod quality_gate;
pub mod scheduler;
pub mod state;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
