//! DetectionState - Alert State Machine
//!
//! ## Responsibilities
//!
//! - Idle -> Ready -> Analyzing -> ThreatActive -> Ready
//! - Hold the latest DetectionResult for display
//! - Tell the caller when an alert must be raised
//!
//! Transitions are a pure function of (state, event); the machine only
//! stores the outcome.

use crate::ai_client::DetectionResult;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionState {
    /// No session
    Idle,
    /// Session active, waiting for the next tick
    Ready,
    /// A gated frame is at the inference endpoint
    Analyzing,
    /// The last result contained a threat
    ThreatActive,
}

impl DetectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionState::Idle => "idle",
            DetectionState::Ready => "ready",
            DetectionState::Analyzing => "analyzing",
            DetectionState::ThreatActive => "threat_active",
        }
    }
}

/// Inputs to the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionEvent {
    Activated,
    Deactivated,
    /// A scheduler tick began
    TickStarted,
    /// The frame passed the gate; inference is about to start
    AnalysisStarted,
    ResultFailed,
    ResultClear,
    ResultThreat,
}

/// Side effect the caller must perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionAction {
    None,
    RaiseAlert,
}

fn transition(state: DetectionState, event: DetectionEvent) -> (DetectionState, DetectionAction) {
    use DetectionAction as A;
    use DetectionEvent as E;
    use DetectionState as S;

    match (state, event) {
        (_, E::Deactivated) => (S::Idle, A::None),
        (S::Idle, E::Activated) => (S::Ready, A::None),
        (s, E::Activated) => (s, A::None),

        // Decay regardless of what this tick ends up doing
        (S::ThreatActive, E::TickStarted) => (S::Ready, A::None),
        (s, E::TickStarted) => (s, A::None),

        (S::Ready, E::AnalysisStarted) => (S::Analyzing, A::None),
        (s, E::AnalysisStarted) => (s, A::None),

        (S::Analyzing, E::ResultFailed) => (S::Ready, A::None),
        (S::Analyzing, E::ResultClear) => (S::Ready, A::None),
        (S::Analyzing, E::ResultThreat) => (S::ThreatActive, A::RaiseAlert),
        // Results outside Analyzing belong to nobody
        (s, E::ResultFailed | E::ResultClear | E::ResultThreat) => (s, A::None),
    }
}

/// Detection state plus the latest result
#[derive(Debug, Clone)]
pub struct DetectionStateMachine {
    state: DetectionState,
    latest: Option<DetectionResult>,
}

impl DetectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: DetectionState::Idle,
            latest: None,
        }
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    pub fn latest_result(&self) -> Option<&DetectionResult> {
        self.latest.as_ref()
    }

    /// Status line for the UI
    pub fn status_text(&self) -> String {
        match (self.state, &self.latest) {
            (DetectionState::Idle, _) => "Camera off".to_string(),
            (DetectionState::Analyzing, _) => "Analyzing...".to_string(),
            (_, Some(result)) => result.status_text(),
            (_, None) => "Waiting for first frame".to_string(),
        }
    }

    pub fn step(&mut self, event: DetectionEvent) -> DetectionAction {
        let (next, action) = transition(self.state, event);
        if next != self.state {
            tracing::trace!(from = self.state.as_str(), to = next.as_str(), "Detection state");
        }
        self.state = next;
        action
    }

    pub fn activate(&mut self) {
        self.latest = None;
        self.step(DetectionEvent::Activated);
    }

    pub fn deactivate(&mut self) {
        self.step(DetectionEvent::Deactivated);
    }

    /// Start of a scheduler tick; ThreatActive decays here
    pub fn begin_tick(&mut self) {
        self.step(DetectionEvent::TickStarted);
    }

    /// Returns false if the machine is not in a state that can analyze
    pub fn analysis_started(&mut self) -> bool {
        self.step(DetectionEvent::AnalysisStarted);
        self.state == DetectionState::Analyzing
    }

    /// Apply an inference result
    pub fn apply_result(&mut self, result: DetectionResult) -> DetectionAction {
        let event = if result.failed {
            DetectionEvent::ResultFailed
        } else if result.threat_present {
            DetectionEvent::ResultThreat
        } else {
            DetectionEvent::ResultClear
        };

        if self.state != DetectionState::Analyzing {
            return DetectionAction::None;
        }

        self.latest = Some(result);
        self.step(event)
    }
}

impl Default for DetectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
