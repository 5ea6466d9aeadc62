//! Caller-side retry loop
//!
//! The manager only says which combination to use and how long to wait; this
//! loop does the waiting and the reporting in the required order:
//!
//! 1. Sleep out any pending backoff, then restart from the first combination.
//! 2. Find a working combination; if none exists, arm a backoff and go to 1.
//! 3. Call out. Success resets backoff and counts usage. Quota failures rotate
//!    freely. General failures rotate and spend one unit of a `K * M * 2`
//!    budget; overspending it is the only error returned. A refused call
//!    (the request itself was bad) is returned as-is without touching usage
//!    or backoff.
//!
//! The returned future may be dropped at any await point. Every manager call
//! it has made up to then leaves the state valid.

use std::future::Future;

use tracing::{debug, info, warn};

use crate::classify::CallError;
use crate::error::{Error, Result};
use crate::manager::{Manager, Rotation, Selection};

/// How a call that produced a value is accounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The combination served the request: usage is counted and backoff
    /// cleared.
    Served(T),
    /// The request was refused for a reason unrelated to the combination.
    Refused(T),
}

/// Run `call` against successive combinations until it succeeds or the
/// general failure budget is spent.
pub async fn drive<T, F, Fut>(manager: &Manager, mut call: F) -> Result<T>
where
    F: FnMut(Selection) -> Fut,
    Fut: Future<Output = std::result::Result<T, CallError>>,
{
    drive_with_outcome(manager, |selection| {
        let attempt = call(selection);
        async move { attempt.await.map(Outcome::Served) }
    })
    .await
}

/// Like `drive`, but the call decides whether a returned value counts as
/// served or refused.
pub async fn drive_with_outcome<T, F, Fut>(manager: &Manager, mut call: F) -> Result<T>
where
    F: FnMut(Selection) -> Fut,
    Fut: Future<Output = std::result::Result<Outcome<T>, CallError>>,
{
    let budget = manager.general_retry_budget();
    let mut general_failures = 0usize;
    let mut attempts = 0usize;

    loop {
        if let Some(wait) = manager.should_wait() {
            info!(
                wait_secs = wait.as_secs(),
                failures = manager.consecutive_failures(),
                "waiting out backoff before retry"
            );
            tokio::time::sleep(wait).await;
            manager.reset_to_first_combination();
        }

        let selection = match manager.find_working() {
            Rotation::Found(selection) => selection,
            Rotation::NotFound => {
                let wait = manager.record_failed_cycle();
                debug!(wait_secs = wait.as_secs(), "no usable combination");
                continue;
            }
        };

        attempts += 1;
        let combination = selection.combination;
        let credential = selection.credential.label().to_string();
        let model = selection.model.clone();

        match call(selection).await {
            Ok(Outcome::Served(value)) => {
                manager.report_success(combination);
                return Ok(value);
            }
            Ok(Outcome::Refused(value)) => {
                debug!(%credential, %model, "request refused, not counted");
                return Ok(value);
            }
            Err(err) if err.is_quota() => {
                warn!(%credential, %model, error = %err.message, "quota exhausted, rotating");
                manager.report_quota_failure(combination);
            }
            Err(err) => {
                general_failures += 1;
                warn!(
                    %credential,
                    %model,
                    error = %err.message,
                    general_failures,
                    budget,
                    "request failed, rotating"
                );
                manager.report_general_failure(combination);
                if general_failures > budget {
                    return Err(Error::AllRetriesExhausted {
                        attempts,
                        last_error: err.message,
                    });
                }
            }
        }
    }
}
