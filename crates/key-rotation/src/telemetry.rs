//! Rotation metrics
//!
//! Emitted through the `metrics` facade; the binary decides where they go.
//!
//! - `rotation_exhausted_total` (counter): label `kind`
//! - `rotation_rotations_total` (counter)
//! - `rotation_failed_cycles_total` (counter)
//! - `rotation_requests_total` (counter): label `model`
//! - `rotation_notifications_total` (counter): label `kind`
//! - `rotation_consecutive_failures` (gauge)

use crate::classify::FailureKind;
use crate::notify::Notification;

pub(crate) fn record_exhausted(kind: FailureKind) {
    metrics::counter!("rotation_exhausted_total", "kind" => kind.label()).increment(1);
}

pub(crate) fn record_rotation() {
    metrics::counter!("rotation_rotations_total").increment(1);
}

pub(crate) fn record_failed_cycle(failures: u32) {
    metrics::counter!("rotation_failed_cycles_total").increment(1);
    set_consecutive_failures(failures);
}

pub(crate) fn record_success(model: &str) {
    metrics::counter!("rotation_requests_total", "model" => model.to_string()).increment(1);
}

pub(crate) fn record_notification(event: &Notification) {
    metrics::counter!("rotation_notifications_total", "kind" => event.kind()).increment(1);
}

pub(crate) fn set_consecutive_failures(failures: u32) {
    metrics::gauge!("rotation_consecutive_failures").set(f64::from(failures));
}
