//! Usage snapshot for observability
//!
//! Everything here is derived at capture time from the per-combination
//! counters and exhaustion records. Per-credential totals are sums over
//! models, never stored separately.

use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::backoff::BackoffState;
use crate::notify::format_hours_minutes;
use crate::registry::{Combination, Registry};
use crate::tracker::ExhaustionTracker;
use crate::usage::UsageCounter;

/// Usage of one model under one credential.
#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub requests: u64,
    pub exhausted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_in_secs: Option<u64>,
}

/// Usage of one credential across all models.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialUsage {
    pub credential: String,
    pub total_requests: u64,
    pub exhausted_models: usize,
    pub models: Vec<ModelUsage>,
}

/// Point-in-time view of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub current_credential: String,
    pub current_model: String,
    pub combinations_total: usize,
    pub combinations_exhausted: usize,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_remaining_secs: Option<u64>,
    pub credentials: Vec<CredentialUsage>,
    #[serde(skip)]
    current_model_index: usize,
}

impl UsageSnapshot {
    pub(crate) fn capture(
        registry: &Registry,
        current: Combination,
        tracker: &ExhaustionTracker,
        usage: &UsageCounter,
        backoff: &BackoffState,
        now: Instant,
    ) -> Self {
        let (current_credential, current_model) = registry.get(current);

        let credentials = registry
            .credentials()
            .iter()
            .enumerate()
            .map(|(ci, credential)| {
                let models: Vec<ModelUsage> = registry
                    .models()
                    .iter()
                    .enumerate()
                    .map(|(mi, model)| {
                        let combination = Combination::new(ci, mi);
                        let exhausted = tracker.is_exhausted(combination, now);
                        ModelUsage {
                            model: model.clone(),
                            requests: usage.count(combination, now),
                            exhausted,
                            resets_in_secs: exhausted
                                .then(|| tracker.resets_in(combination, now))
                                .flatten()
                                .map(|d| d.as_secs()),
                        }
                    })
                    .collect();
                CredentialUsage {
                    credential: credential.label().to_string(),
                    total_requests: models.iter().map(|m| m.requests).sum(),
                    exhausted_models: models.iter().filter(|m| m.exhausted).count(),
                    models,
                }
            })
            .collect();

        Self {
            current_credential: current_credential.label().to_string(),
            current_model: current_model.to_string(),
            combinations_total: registry.total(),
            combinations_exhausted: tracker.exhausted_count(now),
            consecutive_failures: backoff.consecutive_failures(),
            backoff_remaining_secs: backoff.should_wait(now).map(|d| d.as_secs()),
            credentials,
            current_model_index: current.model,
        }
    }
}

impl fmt::Display for UsageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Current model: {}", self.current_model)?;
        writeln!(f, "Current credential: {}", self.current_credential)?;

        for credential in &self.credentials {
            let on_current = &credential.models[self.current_model_index];
            write!(
                f,
                "{}: {} requests on {} ({} total)",
                credential.credential,
                on_current.requests,
                on_current.model,
                credential.total_requests
            )?;
            if credential.exhausted_models == 0 {
                write!(f, " ok")?;
            } else {
                write!(
                    f,
                    " {}/{} models exhausted",
                    credential.exhausted_models,
                    credential.models.len()
                )?;
                let soonest = credential
                    .models
                    .iter()
                    .filter_map(|m| m.resets_in_secs)
                    .min();
                if let Some(secs) = soonest {
                    write!(
                        f,
                        " (resets in {})",
                        format_hours_minutes(std::time::Duration::from_secs(secs))
                    )?;
                }
            }
            writeln!(f)?;
        }

        if self.consecutive_failures > 0 {
            write!(f, "Backoff: {} failed cycles", self.consecutive_failures)?;
            if let Some(secs) = self.backoff_remaining_secs {
                write!(f, ", {secs}s remaining")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
