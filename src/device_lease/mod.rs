//! DeviceLease - Exclusive Camera Slot Ownership
//!
//! ## Responsibilities
//!
//! - At most one active session per logical camera slot
//! - Record which session generation holds the slot and since when
//! - Give the slot back when the lease is dropped
//!
//! Acquisition never waits: a busy slot is reported to the caller as a
//! resource error.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Who holds a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseHolder {
    pub generation: u64,
    pub since: DateTime<Utc>,
    lease_id: u64,
}

type Holders = Arc<Mutex<HashMap<String, LeaseHolder>>>;

fn lock(holders: &Holders) -> MutexGuard<'_, HashMap<String, LeaseHolder>> {
    holders.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Slot registry shared by every session on this host
#[derive(Debug, Default)]
pub struct DeviceLeaseManager {
    holders: Holders,
    next_lease_id: AtomicU64,
}

impl DeviceLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `slot_id` for the session at `generation`, or report the current holder
    pub fn try_acquire(&self, slot_id: &str, generation: u64) -> Result<DeviceLease, LeaseHolder> {
        let mut holders = lock(&self.holders);

        if let Some(holder) = holders.get(slot_id) {
            tracing::debug!(
                camera_slot = %slot_id,
                holder_generation = holder.generation,
                "Camera slot busy"
            );
            return Err(*holder);
        }

        let holder = LeaseHolder {
            generation,
            since: Utc::now(),
            lease_id: self.next_lease_id.fetch_add(1, Ordering::Relaxed),
        };
        holders.insert(slot_id.to_string(), holder);
        tracing::debug!(camera_slot = %slot_id, generation, "Camera slot leased");

        Ok(DeviceLease {
            slot_id: slot_id.to_string(),
            holder,
            holders: self.holders.clone(),
        })
    }

    /// Current holder of `slot_id`, if any
    pub fn holder(&self, slot_id: &str) -> Option<LeaseHolder> {
        lock(&self.holders).get(slot_id).copied()
    }
}

/// Exclusive hold on a camera slot; released on drop
#[derive(Debug)]
pub struct DeviceLease {
    slot_id: String,
    holder: LeaseHolder,
    holders: Holders,
}

impl DeviceLease {
    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    pub fn generation(&self) -> u64 {
        self.holder.generation
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.holder.since
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut holders = lock(&self.holders);
        if holders.get(&self.slot_id).map(|h| h.lease_id) == Some(self.holder.lease_id) {
            holders.remove(&self.slot_id);
        }
        tracing::debug!(
            camera_slot = %self.slot_id,
            generation = self.holder.generation,
            "Camera slot released"
        );
    }
}
