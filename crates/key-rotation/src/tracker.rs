//! Quota exhaustion tracking
//!
//! Exhaustion is a per-combination, time-windowed fact: a credential may be
//! exhausted for one model and still work with another. Records are a flat
//! map from combination to the instant it was marked, and expire once they are
//! `RESET_INTERVAL` old.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::registry::Combination;

/// Length of a provider quota window.
pub const RESET_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Exhaustion records keyed by combination.
#[derive(Debug, Default)]
pub struct ExhaustionTracker {
    records: HashMap<Combination, Instant>,
}

impl ExhaustionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for `combination`.
    pub fn mark_exhausted(&mut self, combination: Combination, now: Instant) {
        self.records.insert(combination, now);
    }

    /// Whether a record exists and is younger than the reset interval.
    ///
    /// Pure query: an expired record is reported as not exhausted but stays in
    /// the map until `prune_expired` runs.
    pub fn is_exhausted(&self, combination: Combination, now: Instant) -> bool {
        self.records
            .get(&combination)
            .is_some_and(|marked| now.saturating_duration_since(*marked) < RESET_INTERVAL)
    }

    /// Remove every record whose age is at least the reset interval.
    ///
    /// Returns the combinations that were pruned; a non-empty result is a quota
    /// reset event.
    pub fn prune_expired(&mut self, now: Instant) -> Vec<Combination> {
        let mut pruned = Vec::new();
        self.records.retain(|combination, marked| {
            let expired = now.saturating_duration_since(*marked) >= RESET_INTERVAL;
            if expired {
                pruned.push(*combination);
            }
            !expired
        });
        pruned.sort();
        pruned
    }

    /// Time until `combination` becomes eligible again, if it is exhausted.
    pub fn resets_in(&self, combination: Combination, now: Instant) -> Option<Duration> {
        let marked = self.records.get(&combination)?;
        RESET_INTERVAL
            .checked_sub(now.saturating_duration_since(*marked))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Time until the earliest active record expires.
    pub fn next_reset(&self, now: Instant) -> Option<Duration> {
        self.records
            .keys()
            .filter_map(|combination| self.resets_in(*combination, now))
            .min()
    }

    /// Number of combinations currently exhausted.
    pub fn exhausted_count(&self, now: Instant) -> usize {
        self.records
            .keys()
            .filter(|combination| self.is_exhausted(**combination, now))
            .count()
    }
}
