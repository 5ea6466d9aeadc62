//! Per-combination request counters
//!
//! One counter per combination, never per credential: per-credential totals
//! are derived by summing over models. A counter's window starts at its first
//! counted request and restarts after `RESET_INTERVAL`, or earlier when the
//! combination's exhaustion record is pruned.

use std::collections::HashMap;
use std::time::Instant;

use crate::registry::Combination;
use crate::tracker::RESET_INTERVAL;

#[derive(Debug, Clone, Copy)]
struct UsageWindow {
    count: u64,
    started: Instant,
}

impl UsageWindow {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= RESET_INTERVAL
    }
}

/// Successful request counts keyed by combination.
#[derive(Debug, Default)]
pub struct UsageCounter {
    windows: HashMap<Combination, UsageWindow>,
}

impl UsageCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one successful request. Returns the new count.
    pub fn record(&mut self, combination: Combination, now: Instant) -> u64 {
        let window = self
            .windows
            .entry(combination)
            .or_insert(UsageWindow {
                count: 0,
                started: now,
            });
        if window.expired(now) {
            *window = UsageWindow {
                count: 0,
                started: now,
            };
        }
        window.count += 1;
        window.count
    }

    /// Count for the combination's current window.
    pub fn count(&self, combination: Combination, now: Instant) -> u64 {
        match self.windows.get(&combination) {
            Some(window) if !window.expired(now) => window.count,
            _ => 0,
        }
    }

    /// Zero the combination's counter.
    pub fn reset(&mut self, combination: Combination) {
        self.windows.remove(&combination);
    }
}
