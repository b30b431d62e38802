//! Scheduler - Sampling Cadence
//!
//! ## Responsibilities
//!
//! - Fire the tick immediately on start, then on a fixed period
//! - At most one tick in flight (busy ticks are skipped, never queued)
//! - Clear the busy flag on every exit path, including panics
//! - Optional backoff after failed ticks
//!
//! `running` and `analyzing` are atomics flipped at the moment of decision,
//! so the very next tick sees them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

pub const DEFAULT_PERIOD_MS: u64 = 1500;

/// Whole milliseconds, saturating at `u64::MAX`
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// What a tick ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Analyzed { threat: bool },
    InferenceFailed,
    QualityRejected,
    CaptureFailed,
    /// Session moved on while the tick was running
    Superseded,
}

impl TickOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TickOutcome::InferenceFailed | TickOutcome::CaptureFailed)
    }
}

/// Delay policy after consecutive failed ticks
pub trait BackoffPolicy: Send + Sync {
    /// `consecutive_failures` is at least 1. None means tick on schedule.
    fn delay_after(&self, consecutive_failures: u32) -> Option<Duration>;

    fn name(&self) -> &'static str;
}

/// Keep the cadence no matter what
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn delay_after(&self, _consecutive_failures: u32) -> Option<Duration> {
        None
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// base * 2^(n-1), capped at max
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_PERIOD_MS), Duration::from_secs(30))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay_after(&self, consecutive_failures: u32) -> Option<Duration> {
        let exp = consecutive_failures.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exp);
        Some(delay.min(self.max))
    }

    fn name(&self) -> &'static str {
        "exponential"
    }
}

/// Configured backoff selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    #[default]
    None,
    Exponential,
}

impl BackoffKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "" => Some(BackoffKind::None),
            "exponential" | "exp" => Some(BackoffKind::Exponential),
            _ => None,
        }
    }

    /// Policy with `base` as the first delay
    pub fn policy(&self, base: Duration) -> Box<dyn BackoffPolicy> {
        match self {
            BackoffKind::None => Box::new(NoBackoff),
            BackoffKind::Exponential => {
                Box::new(ExponentialBackoff::new(base, Duration::from_secs(30).max(base)))
            }
        }
    }
}

/// Counters and timestamps exposed for status
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub analyzing: bool,
    pub period_ms: u64,
    pub backoff: &'static str,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub ticks_dispatched: u64,
    pub ticks_skipped_busy: u64,
    pub ticks_skipped_backoff: u64,
    pub consecutive_failures: u32,
}

#[derive(Default)]
struct Counters {
    last_tick_at: Option<DateTime<Utc>>,
    dispatched: u64,
    skipped_busy: u64,
    skipped_backoff: u64,
    consecutive_failures: u32,
    resume_at: Option<Instant>,
}

struct Shared {
    running: AtomicBool,
    analyzing: AtomicBool,
    counters: Mutex<Counters>,
    backoff: Box<dyn BackoffPolicy>,
}

impl Shared {
    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, outcome: TickOutcome) {
        let mut counters = self.counters();

        if outcome.is_failure() {
            counters.consecutive_failures = counters.consecutive_failures.saturating_add(1);
            if let Some(delay) = self.backoff.delay_after(counters.consecutive_failures) {
                counters.resume_at = Some(Instant::now() + delay);
                tracing::debug!(
                    failures = counters.consecutive_failures,
                    delay_ms = millis(delay),
                    "Backing off after failed tick"
                );
            }
        } else if matches!(outcome, TickOutcome::Analyzed { .. }) {
            counters.consecutive_failures = 0;
            counters.resume_at = None;
        }
    }
}

/// Clears `analyzing` when the tick task ends, however it ends
struct AnalyzingGuard(Arc<Shared>);

impl Drop for AnalyzingGuard {
    fn drop(&mut self) {
        self.0.analyzing.store(false, Ordering::SeqCst);
    }
}

/// Fixed-cadence tick driver
pub struct Scheduler {
    shared: Arc<Shared>,
    period: Mutex<Duration>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_backoff(Box::new(NoBackoff))
    }

    pub fn with_backoff(backoff: Box<dyn BackoffPolicy>) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                analyzing: AtomicBool::new(false),
                counters: Mutex::new(Counters::default()),
                backoff,
            }),
            period: Mutex::new(Duration::from_millis(DEFAULT_PERIOD_MS)),
            handle: Mutex::new(None),
        }
    }

    /// Run `tick` now and then every `period` until stopped.
    ///
    /// Each tick runs as its own task, so a slow tick never delays the
    /// cadence; it only makes the following ticks skip.
    pub fn start<F, Fut>(&self, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TickOutcome> + Send + 'static,
    {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Scheduler already running");
            return;
        }

        let period = period.max(Duration::from_millis(1));
        *self.period.lock().unwrap_or_else(PoisonError::into_inner) = period;
        {
            let mut counters = self.shared.counters();
            counters.consecutive_failures = 0;
            counters.resume_at = None;
        }

        tracing::info!(
            period_ms = millis(period),
            backoff = self.shared.backoff.name(),
            "Starting scheduler"
        );

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }

                Self::dispatch(&shared, &tick);
            }

            tracing::debug!("Scheduler loop exited");
        });

        let previous = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn dispatch<F, Fut>(shared: &Arc<Shared>, tick: &F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = TickOutcome> + Send + 'static,
    {
        {
            let mut counters = shared.counters();
            if let Some(resume_at) = counters.resume_at {
                if Instant::now() < resume_at {
                    counters.skipped_backoff += 1;
                    tracing::trace!("Tick skipped: backing off");
                    return;
                }
            }
        }

        if shared
            .analyzing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            shared.counters().skipped_busy += 1;
            tracing::trace!("Tick skipped: previous analysis still in flight");
            return;
        }

        let guard = AnalyzingGuard(shared.clone());
        {
            let mut counters = shared.counters();
            counters.dispatched += 1;
            counters.last_tick_at = Some(Utc::now());
        }

        let fut = tick();
        tokio::spawn(async move {
            let outcome = fut.await;
            guard.0.record(outcome);
        });
    }

    /// Stop ticking. An in-flight tick is left to finish on its own.
    pub fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);

        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        if was_running {
            tracing::info!("Scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_analyzing(&self) -> bool {
        self.shared.analyzing.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SchedulerStats {
        let period = *self.period.lock().unwrap_or_else(PoisonError::into_inner);
        let counters = self.shared.counters();

        SchedulerStats {
            running: self.is_running(),
            analyzing: self.is_analyzing(),
            period_ms: millis(period),
            backoff: self.shared.backoff.name(),
            last_tick_at: counters.last_tick_at,
            ticks_dispatched: counters.dispatched,
            ticks_skipped_busy: counters.skipped_busy,
            ticks_skipped_backoff: counters.skipped_backoff,
            consecutive_failures: counters.consecutive_failures,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn counting_tick(
        counter: Arc<AtomicUsize>,
        outcome: TickOutcome,
    ) -> impl Fn() -> std::future::Ready<TickOutcome> + Send + Sync + 'static {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(outcome)
        }
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_millis(5000));
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(2000)));
        assert_eq!(policy.delay_after(3), Some(Duration::from_millis(4000)));
        assert_eq!(policy.delay_after(4), Some(Duration::from_millis(5000)));
        assert_eq!(policy.delay_after(400), Some(Duration::from_millis(5000)));
        assert_eq!(NoBackoff.delay_after(3), None);
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn backoff_kind_parses_config_values() {
        assert_eq!(BackoffKind::parse("none"), Some(BackoffKind::None));
        assert_eq!(BackoffKind::parse(" Exponential "), Some(BackoffKind::Exponential));
        assert_eq!(BackoffKind::parse("linear"), None);
        assert_eq!(BackoffKind::Exponential.policy(Duration::from_secs(1)).name(), "exponential");
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_is_immediate_then_periodic() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        scheduler.start(
            Duration::from_millis(1500),
            counting_tick(counter.clone(), TickOutcome::Analyzed { threat: false }),
        );

        sleep(Duration::from_millis(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        sleep(Duration::from_millis(3000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(scheduler.stats().last_tick_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_ticks_are_skipped_not_queued() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let scheduler = Scheduler::new();
        {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            scheduler.start(Duration::from_millis(1500), move || {
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(4000)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    TickOutcome::Analyzed { threat: false }
                }
            });
        }

        sleep(Duration::from_millis(10_000)).await;

        let stats = scheduler.stats();
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(stats.ticks_skipped_busy >= 3);
        assert_eq!(stats.ticks_dispatched, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_tick_releases_busy_flag() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        {
            let counter = counter.clone();
            scheduler.start(Duration::from_millis(1500), move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("tick exploded");
                    }
                    TickOutcome::Analyzed { threat: false }
                }
            });
        }

        sleep(Duration::from_millis(1)).await;
        assert!(!scheduler.is_analyzing());

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_ticks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        scheduler.start(
            Duration::from_millis(1500),
            counting_tick(counter.clone(), TickOutcome::QualityRejected),
        );

        sleep(Duration::from_millis(1)).await;
        scheduler.stop();
        assert!(!scheduler.is_running());

        sleep(Duration::from_millis(6000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_when_policy_installed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::with_backoff(Box::new(ExponentialBackoff::new(
            Duration::from_millis(2000),
            Duration::from_secs(60),
        )));
        scheduler.start(
            Duration::from_millis(1500),
            counting_tick(counter.clone(), TickOutcome::InferenceFailed),
        );

        // Dispatch at 0 and 3000 (resume 2000), then 7500 (resume 7000)
        sleep(Duration::from_millis(7600)).await;

        let stats = scheduler.stats();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(stats.ticks_skipped_backoff, 3);
        assert_eq!(stats.consecutive_failures, 3);
        assert_eq!(stats.backoff, "exponential");
    }

    #[tokio::test(start_paused = true)]
    async fn failures_keep_cadence_without_backoff() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();
        scheduler.start(
            Duration::from_millis(1500),
            counting_tick(counter.clone(), TickOutcome::InferenceFailed),
        );

        sleep(Duration::from_millis(4600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.stats().ticks_skipped_backoff, 0);
    }
}
