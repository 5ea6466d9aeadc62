//! Pushover delivery for rotation alerts
//!
//! The manager calls `notify` synchronously after releasing its lock; the
//! HTTP post runs on a spawned task so a slow or failing Pushover API never
//! delays a request.

use common::Secret;
use key_rotation::notify::{format_hours_minutes, format_wait};
use key_rotation::{Notification, Notifier};
use tracing::{debug, warn};

/// Posts notifications to the Pushover messages API.
pub struct PushoverNotifier {
    client: reqwest::Client,
    api_url: String,
    title_prefix: String,
    token: Secret<String>,
    user: Secret<String>,
}

/// A rendered Pushover message.
#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    pub title: String,
    pub body: String,
    pub priority: i8,
}

impl PushoverNotifier {
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        title_prefix: String,
        token: Secret<String>,
        user: Secret<String>,
    ) -> Self {
        Self {
            client,
            api_url,
            title_prefix,
            token,
            user,
        }
    }

    /// Render an event. Exhaustion is high priority; backoff is informational.
    pub fn render(&self, event: &Notification) -> Message {
        match event {
            Notification::AllCombinationsExhausted {
                combinations,
                next_reset,
            } => {
                let reset = next_reset
                    .map(format_hours_minutes)
                    .unwrap_or_else(|| "unknown".into());
                Message {
                    title: format!("{}: Quota Exhausted", self.title_prefix),
                    body: format!(
                        "All {combinations} API key and model combinations are exhausted. \
                         Next reset in {reset}."
                    ),
                    priority: 1,
                }
            }
            Notification::EnteringBackoff { wait, failures } => Message {
                title: format!("{}: Waiting", self.title_prefix),
                body: format!(
                    "Every combination failed ({failures} consecutive cycles). \
                     Waiting {} before retrying.",
                    format_wait(*wait)
                ),
                priority: 0,
            },
        }
    }
}

impl Notifier for PushoverNotifier {
    fn notify(&self, event: &Notification) {
        let message = self.render(event);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(kind = event.kind(), "no async runtime, dropping notification");
            return;
        };

        let priority = message.priority.to_string();
        let request = self.client.post(&self.api_url).form(&[
            ("token", self.token.expose().as_str()),
            ("user", self.user.expose().as_str()),
            ("title", message.title.as_str()),
            ("message", message.body.as_str()),
            ("priority", priority.as_str()),
        ]);
        let kind = event.kind();

        runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(kind, "pushover notification sent");
                }
                Ok(response) => {
                    warn!(kind, status = %response.status(), "pushover rejected notification");
                }
                Err(e) => warn!(kind, error = %e, "failed to send pushover notification"),
            }
        });
    }
}
