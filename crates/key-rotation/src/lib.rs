//! Credential × model rotation with quota tracking and backoff
//!
//! Keeps a service available against per-credential, per-model daily quotas.
//! Credentials and models form a fixed pool of combinations; when one is
//! exhausted the manager moves to the next untried one, and when the whole
//! pool is exhausted it asks the caller to back off until quotas reset.
//!
//! Lifecycle of a combination:
//! 1. Starts usable; the manager begins at the first credential and best model
//! 2. Caller reports a quota or general failure → marked exhausted for 24h
//! 3. Rotation moves credential-major: all credentials on a model, then the
//!    next model
//! 4. A lap back to the first combination counts as a failed cycle and arms an
//!    exponential backoff (60s doubling to 30m)
//! 5. After 24h the record is pruned and the combination is usable again
//! 6. Any success clears backoff state entirely

pub mod backoff;
pub mod classify;
pub mod clock;
pub mod driver;
pub mod error;
pub mod manager;
pub mod notify;
pub mod policy;
pub mod registry;
pub mod stats;
mod telemetry;
pub mod tracker;
pub mod usage;

pub use backoff::{BackoffState, INITIAL_BACKOFF, MAX_BACKOFF, backoff_duration};
pub use classify::{CallError, FailureKind, classify_message, classify_status};
pub use clock::{Clock, ManualClock, RuntimeClock};
pub use driver::{Outcome, drive, drive_with_outcome};
pub use error::{Error, Result};
pub use manager::{Manager, Rotation, Selection};
pub use notify::{LogNotifier, Notification, Notifier};
pub use registry::{Combination, Credential, Registry};
pub use stats::{CredentialUsage, ModelUsage, UsageSnapshot};
pub use tracker::{ExhaustionTracker, RESET_INTERVAL};
pub use usage::UsageCounter;
