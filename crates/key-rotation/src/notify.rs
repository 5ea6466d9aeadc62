//! Alert call-outs
//!
//! The manager reports two events and does not care how they are delivered.
//! Events are collected while the state lock is held and dispatched after it
//! is released, so a slow notifier never blocks rotation.

use std::time::Duration;

use tracing::warn;

/// Events the manager raises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Every combination is exhausted. Raised once per exhaustion episode.
    AllCombinationsExhausted {
        combinations: usize,
        /// Time until the earliest exhaustion record expires.
        next_reset: Option<Duration>,
    },
    /// A failed full cycle armed a backoff.
    EnteringBackoff { wait: Duration, failures: u32 },
}

impl Notification {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::AllCombinationsExhausted { .. } => "all_combinations_exhausted",
            Notification::EnteringBackoff { .. } => "entering_backoff",
        }
    }
}

/// Delivery channel for notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &Notification);
}

/// Emits notifications as tracing warnings.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &Notification) {
        match event {
            Notification::AllCombinationsExhausted {
                combinations,
                next_reset,
            } => warn!(
                combinations,
                next_reset_secs = next_reset.map(|d| d.as_secs()),
                "all credential and model combinations exhausted"
            ),
            Notification::EnteringBackoff { wait, failures } => warn!(
                wait_secs = wait.as_secs(),
                failures,
                "entering backoff after failed rotation cycle"
            ),
        }
    }
}

/// Render a duration as "Xh Ym" for human-facing messages.
pub fn format_hours_minutes(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
}

/// Render a wait as "N minutes M seconds" for human-facing messages.
pub fn format_wait(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (minutes, seconds) = (secs / 60, secs % 60);
    let plural = |n: u64, unit: &str| {
        if n == 1 {
            format!("{n} {unit}")
        } else {
            format!("{n} {unit}s")
        }
    };
    match (minutes, seconds) {
        (0, s) => plural(s, "second"),
        (m, 0) => plural(m, "minute"),
        (m, s) => format!("{} {}", plural(m, "minute"), plural(s, "second")),
    }
}
