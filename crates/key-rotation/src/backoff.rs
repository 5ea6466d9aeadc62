//! Exponential backoff after failed rotation cycles
//!
//! A cycle fails when rotation laps the whole pool without a success. Each
//! failed cycle doubles the wait, starting at `INITIAL_BACKOFF` and capped at
//! `MAX_BACKOFF`. Any success forgives all prior failures.

use std::time::{Duration, Instant};

/// Wait after the first failed cycle.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(60);

/// Upper bound on any single wait.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30 * 60);

/// Wait for the given number of consecutive failed cycles.
///
/// `min(INITIAL * 2^(failures-1), MAX)` for `failures >= 1`, zero otherwise.
pub fn backoff_duration(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    // 2^16 minutes is far past the cap; clamp the shift so it cannot overflow.
    let shift = (failures - 1).min(16);
    INITIAL_BACKOFF
        .saturating_mul(1u32 << shift)
        .min(MAX_BACKOFF)
}

/// Failure count and timestamp, always set together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingBackoff {
    failures: u32,
    last_failure: Instant,
}

/// Backoff bookkeeping. Empty means no backoff is pending.
#[derive(Debug, Default, Clone)]
pub struct BackoffState {
    pending: Option<PendingBackoff>,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed full cycle. Returns the new consecutive failure count.
    pub fn record_cycle_failure(&mut self, now: Instant) -> u32 {
        let failures = self.consecutive_failures().saturating_add(1);
        self.pending = Some(PendingBackoff {
            failures,
            last_failure: now,
        });
        failures
    }

    /// Clear all failures. Returns how many were forgiven.
    pub fn reset(&mut self) -> u32 {
        self.pending
            .take()
            .map(|pending| pending.failures)
            .unwrap_or(0)
    }

    /// Remaining wait, if the current backoff has not elapsed yet.
    pub fn should_wait(&self, now: Instant) -> Option<Duration> {
        let pending = self.pending?;
        let elapsed = now.saturating_duration_since(pending.last_failure);
        backoff_duration(pending.failures)
            .checked_sub(elapsed)
            .filter(|remaining| !remaining.is_zero())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.pending.map(|pending| pending.failures).unwrap_or(0)
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.pending.map(|pending| pending.last_failure)
    }
}
