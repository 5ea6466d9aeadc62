//! Rotation manager
//!
//! Owns the registry and the one piece of mutable state shared by the tracker,
//! rotation policy and backoff controller. Every operation takes the same lock,
//! so concurrent request tasks see a linearizable sequence of rotations. The
//! manager is synchronous and never sleeps; callers ask how long to wait and do
//! the waiting themselves (see `driver`).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backoff::{BackoffState, backoff_duration};
use crate::classify::FailureKind;
use crate::clock::{Clock, RuntimeClock};
use crate::error::Result;
use crate::notify::{LogNotifier, Notification, Notifier};
use crate::policy;
use crate::registry::{Combination, Credential, Registry};
use crate::stats::UsageSnapshot;
use crate::telemetry;
use crate::tracker::ExhaustionTracker;
use crate::usage::UsageCounter;

/// A combination resolved to its credential and model.
#[derive(Debug, Clone)]
pub struct Selection {
    pub combination: Combination,
    pub credential: Credential,
    pub model: String,
}

/// Outcome of searching for a usable combination.
#[derive(Debug, Clone)]
pub enum Rotation {
    Found(Selection),
    NotFound,
}

impl Rotation {
    pub fn is_found(&self) -> bool {
        matches!(self, Rotation::Found(_))
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    cursor: usize,
    tracker: ExhaustionTracker,
    usage: UsageCounter,
    backoff: BackoffState,
    /// Set once the all-exhausted alert fired; cleared by a quota reset.
    notified: bool,
}

/// Rotation and backoff manager for a credential × model pool.
///
/// Created once by the composition root and shared as `Arc<Manager>`.
pub struct Manager {
    registry: Registry,
    state: Mutex<ManagerState>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

impl Manager {
    /// Create a manager starting at the first combination.
    ///
    /// Uses the runtime clock and log notifier; override with `with_clock` and
    /// `with_notifier`. Fails if either list is empty.
    pub fn new(credentials: Vec<Credential>, models: Vec<String>) -> Result<Self> {
        let registry = Registry::new(credentials, models)?;
        let (k, m) = registry.size();
        info!(
            credentials = k,
            models = m,
            combinations = registry.total(),
            "rotation manager initialized"
        );
        telemetry::set_consecutive_failures(0);
        Ok(Self {
            registry,
            state: Mutex::new(ManagerState::default()),
            clock: Arc::new(RuntimeClock),
            notifier: Arc::new(LogNotifier),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Retry budget for general failures in one driving loop: `K * M * 2`.
    pub fn general_retry_budget(&self) -> usize {
        self.registry.total() * 2
    }

    /// Combination under the cursor, without searching.
    pub fn current_combination(&self) -> Selection {
        let cursor = self.lock().cursor;
        self.selection(self.registry.combination_at(cursor))
    }

    /// Find the next usable combination starting at the current position.
    ///
    /// Prunes expired exhaustion records first. On success the position moves
    /// to the found combination. When every combination is exhausted the
    /// position is left alone and the all-exhausted alert fires, at most once
    /// per exhaustion episode.
    pub fn find_working(&self) -> Rotation {
        let now = self.clock.now();
        let mut events = Vec::new();

        let found = {
            let mut state = self.lock();
            self.prune(&mut state, now);

            match policy::scan(&self.registry, &state.tracker, state.cursor, now) {
                Some(cursor) => {
                    if cursor != state.cursor {
                        let from = self.registry.combination_at(state.cursor);
                        let to = self.registry.combination_at(cursor);
                        info!(
                            from = %self.describe(from),
                            to = %self.describe(to),
                            "switched to working combination"
                        );
                        state.cursor = cursor;
                    }
                    Some(self.registry.combination_at(cursor))
                }
                None => {
                    if !state.notified {
                        state.notified = true;
                        events.push(Notification::AllCombinationsExhausted {
                            combinations: self.registry.total(),
                            next_reset: state.tracker.next_reset(now),
                        });
                    }
                    None
                }
            }
        };

        self.dispatch(events);
        match found {
            Some(combination) => Rotation::Found(self.selection(combination)),
            None => Rotation::NotFound,
        }
    }

    /// Mark a combination exhausted as of now.
    pub fn mark_exhausted(&self, combination: Combination) {
        let now = self.clock.now();
        let mut state = self.lock();
        self.mark(&mut state, combination, FailureKind::QuotaExhausted, now);
    }

    /// Whether a combination is currently exhausted.
    pub fn is_exhausted(&self, combination: Combination) -> bool {
        let now = self.clock.now();
        self.lock().tracker.is_exhausted(combination, now)
    }

    /// Advance one step in credential-major order.
    ///
    /// Wrapping back to the first combination completes a lap, which counts as
    /// a failed cycle and arms the next backoff.
    pub fn rotate_to_next(&self) {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            self.advance(&mut state, now, &mut events);
        }
        self.dispatch(events);
    }

    /// Record a successful request on `combination`.
    ///
    /// Clears all backoff state and counts the request.
    pub fn report_success(&self, combination: Combination) {
        let now = self.clock.now();
        let count = {
            let mut state = self.lock();
            self.forgive(&mut state);
            state.usage.record(combination, now)
        };
        let (credential, model) = self.registry.get(combination);
        telemetry::record_success(model);
        debug!(
            credential = credential.label(),
            model,
            requests = count,
            "request succeeded"
        );
    }

    /// Record a quota exhaustion on `combination` and rotate away from it.
    pub fn report_quota_failure(&self, combination: Combination) {
        self.report_failure(combination, FailureKind::QuotaExhausted);
    }

    /// Record a general failure on `combination` and rotate away from it.
    ///
    /// The combination is presumed unhealthy and marked exhausted too.
    pub fn report_general_failure(&self, combination: Combination) {
        self.report_failure(combination, FailureKind::General);
    }

    /// Mark `combination` exhausted and rotate, if the position still points
    /// at it. When another task already rotated past it, the position is left
    /// alone so the same slot is never skipped twice.
    pub fn report_failure(&self, combination: Combination, kind: FailureKind) {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            self.mark(&mut state, combination, kind, now);
            if self.registry.combination_at(state.cursor) == combination {
                self.advance(&mut state, now, &mut events);
            } else {
                debug!(
                    failed = %self.describe(combination),
                    "position already moved past failed combination"
                );
            }
        }
        self.dispatch(events);
    }

    /// Arm a backoff because a search found nothing usable.
    ///
    /// Does nothing if a backoff is already pending. Returns the wait now in
    /// force.
    pub fn record_failed_cycle(&self) -> Duration {
        let now = self.clock.now();
        let mut events = Vec::new();
        let wait = {
            let mut state = self.lock();
            match state.backoff.should_wait(now) {
                Some(remaining) => remaining,
                None => self.fail_cycle(&mut state, now, &mut events),
            }
        };
        self.dispatch(events);
        wait
    }

    /// Remaining backoff wait, if any.
    pub fn should_wait(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.lock().backoff.should_wait(now)
    }

    /// Clear all backoff state. Returns the number of failures forgiven.
    pub fn reset_backoff(&self) -> u32 {
        let mut state = self.lock();
        self.forgive(&mut state)
    }

    /// Snap back to the best model and first credential.
    pub fn reset_to_first_combination(&self) {
        let mut state = self.lock();
        state.cursor = 0;
        info!(
            combination = %self.describe(Combination::FIRST),
            "reset to first combination"
        );
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().backoff.consecutive_failures()
    }

    /// Point-in-time usage and exhaustion view.
    pub fn usage_stats(&self) -> UsageSnapshot {
        let now = self.clock.now();
        let state = self.lock();
        UsageSnapshot::capture(
            &self.registry,
            self.registry.combination_at(state.cursor),
            &state.tracker,
            &state.usage,
            &state.backoff,
            now,
        )
    }

    /// Health summary: healthy when nothing is exhausted, degraded when some
    /// combinations are, unhealthy when all are.
    pub fn health(&self) -> serde_json::Value {
        let snapshot = self.usage_stats();
        let total = snapshot.combinations_total;
        let exhausted = snapshot.combinations_exhausted;
        let status = if exhausted == 0 {
            "healthy"
        } else if exhausted < total {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "combinations_total": total,
            "combinations_available": total - exhausted,
            "combinations_exhausted": exhausted,
            "consecutive_failures": snapshot.consecutive_failures,
            "backoff_remaining_secs": snapshot.backoff_remaining_secs,
            "current": {
                "credential": snapshot.current_credential,
                "model": snapshot.current_model,
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        // Every mutation leaves the state consistent, so a poisoned lock is
        // still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn selection(&self, combination: Combination) -> Selection {
        let (credential, model) = self.registry.get(combination);
        Selection {
            combination,
            credential: credential.clone(),
            model: model.to_string(),
        }
    }

    fn describe(&self, combination: Combination) -> String {
        let (credential, model) = self.registry.get(combination);
        format!("{} + {}", credential.label(), model)
    }

    fn prune(&self, state: &mut ManagerState, now: Instant) {
        let pruned = state.tracker.prune_expired(now);
        if pruned.is_empty() {
            return;
        }
        for combination in &pruned {
            state.usage.reset(*combination);
        }
        state.notified = false;
        info!(
            reactivated = pruned.len(),
            "quota window passed, combinations available again"
        );
    }

    fn mark(
        &self,
        state: &mut ManagerState,
        combination: Combination,
        kind: FailureKind,
        now: Instant,
    ) {
        state.tracker.mark_exhausted(combination, now);
        telemetry::record_exhausted(kind);
        warn!(
            combination = %self.describe(combination),
            kind = kind.label(),
            "marked combination exhausted"
        );
    }

    fn advance(&self, state: &mut ManagerState, now: Instant, events: &mut Vec<Notification>) {
        let from = self.registry.combination_at(state.cursor);
        let step = policy::advance(&self.registry, state.cursor);
        state.cursor = step.cursor;
        telemetry::record_rotation();

        let to = self.registry.combination_at(step.cursor);
        info!(
            from = %self.describe(from),
            to = %self.describe(to),
            "rotated"
        );
        if step.lapped {
            self.fail_cycle(state, now, events);
        }
    }

    fn fail_cycle(
        &self,
        state: &mut ManagerState,
        now: Instant,
        events: &mut Vec<Notification>,
    ) -> Duration {
        let failures = state.backoff.record_cycle_failure(now);
        let wait = backoff_duration(failures);
        telemetry::record_failed_cycle(failures);
        warn!(
            combinations = self.registry.total(),
            failures,
            wait_secs = wait.as_secs(),
            "full rotation cycle failed"
        );
        events.push(Notification::EnteringBackoff { wait, failures });
        wait
    }

    fn forgive(&self, state: &mut ManagerState) -> u32 {
        let forgiven = state.backoff.reset();
        if forgiven > 0 {
            info!(forgiven, "request succeeded, backoff reset");
            telemetry::set_consecutive_failures(0);
        }
        forgiven
    }

    fn dispatch(&self, events: Vec<Notification>) {
        for event in &events {
            telemetry::record_notification(event);
            self.notifier.notify(event);
        }
    }
}
