//! AlertSink - Cooldown Suppression and Alert History
//!
//! ## Responsibilities
//!
//! - Keep the last K alerts (ring buffer, oldest evicted first)
//! - Decide which alerts are persisted (at most one per cooldown window)
//! - Forward persisted alerts to the AlertStore without blocking the tick

use crate::ai_client::{DetectionResult, WeaponEntry};
use crate::detection_log_client::{AlertStore, NewDetectionRecord};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const DEFAULT_HISTORY_CAPACITY: usize = 7;
pub const DEFAULT_COOLDOWN_MS: u64 = 3000;

/// A threat result plus the frame it was found in
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub result: DetectionResult,
    /// JPEG bytes; base64 on the wire
    #[serde(serialize_with = "serialize_base64")]
    pub image: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub persisted: bool,
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

impl Alert {
    pub fn new(result: DetectionResult, image: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: result.received_at,
            result,
            image,
            persisted: false,
        }
    }

    /// Record shape the backend expects
    pub fn to_record(&self) -> NewDetectionRecord {
        NewDetectionRecord {
            image: base64::engine::general_purpose::STANDARD.encode(&self.image),
            weapons: self.result.items.iter().map(WeaponEntry::from).collect(),
            confidence: self.result.overall_confidence,
            detected_at: self.created_at,
        }
    }
}

/// Bounded FIFO of alerts
#[derive(Debug, Clone)]
pub struct AlertHistory {
    alerts: VecDeque<Alert>,
    capacity: usize,
}

impl AlertHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            alerts: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, alert: Alert) {
        while self.alerts.len() >= self.capacity {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }

    /// Newest first
    pub fn latest(&self, count: usize) -> Vec<Alert> {
        self.alerts.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Cooldown gate in front of persistence
#[derive(Debug, Clone)]
pub struct AlertSink {
    history: AlertHistory,
    cooldown: chrono::Duration,
    last_persist_at: Option<DateTime<Utc>>,
}

impl AlertSink {
    pub fn new(capacity: usize, cooldown_ms: u64) -> Self {
        let cooldown_ms = i64::try_from(cooldown_ms).unwrap_or(i64::MAX);
        Self {
            history: AlertHistory::new(capacity),
            cooldown: chrono::Duration::milliseconds(cooldown_ms),
            last_persist_at: None,
        }
    }

    /// Mark the alert persisted or not, then append it to history.
    ///
    /// Returns the alert as stored; the caller forwards it when `persisted`.
    pub fn offer(&mut self, mut alert: Alert) -> Alert {
        let due = match self.last_persist_at {
            None => true,
            Some(last) => alert.created_at - last >= self.cooldown,
        };

        if due {
            alert.persisted = true;
            self.last_persist_at = Some(alert.created_at);
        } else {
            tracing::debug!(alert_id = %alert.id, "Alert within cooldown, not persisted");
        }

        self.history.push(alert.clone());
        alert
    }

    pub fn history(&self) -> &AlertHistory {
        &self.history
    }

    pub fn last_persist_at(&self) -> Option<DateTime<Utc>> {
        self.last_persist_at
    }

    pub fn cooldown_ms(&self) -> i64 {
        self.cooldown.num_milliseconds()
    }
}

impl Default for AlertSink {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_COOLDOWN_MS)
    }
}

/// Ships persisted alerts to the store in the background
#[derive(Clone)]
pub struct AlertForwarder {
    store: Arc<dyn AlertStore>,
}

impl AlertForwarder {
    pub fn new(store: Arc<dyn AlertStore>) -> Self {
        Self { store }
    }

    /// Failures are logged and swallowed; `persisted` stays set
    pub fn forward(&self, alert: &Alert) -> JoinHandle<()> {
        let store = self.store.clone();
        let alert_id = alert.id;
        let record = alert.to_record();

        tokio::spawn(async move {
            match store.save(&record).await {
                Ok(record_id) => {
                    tracing::info!(
                        alert_id = %alert_id,
                        record_id = %record_id,
                        "Alert persisted"
                    );
                }
                Err(e) => {
                    tracing::warn!(alert_id = %alert_id, error = %e, "Failed to persist alert");
                }
            }
        })
    }
}
