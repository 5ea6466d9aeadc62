//! Failure classification for upstream responses
//!
//! Quota exhaustion rotates to the next combination without consuming the
//! general retry budget; every other failure is general. Gemini signals quota
//! exhaustion with HTTP 429 and a `RESOURCE_EXHAUSTED` status, and client
//! libraries often surface it only as text, so both status and message are
//! inspected.

use std::fmt;

/// Markers in an error body that indicate quota exhaustion (matched lowercase).
const QUOTA_BODY_PATTERNS: &[&str] = &["resource_exhausted", "quota"];

/// Kind of failure reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Daily quota for the combination is used up.
    QuotaExhausted,
    /// Anything else.
    General,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::QuotaExhausted => "quota",
            FailureKind::General => "general",
        }
    }
}

/// Classify a free-form error message, e.g. a client library's error string.
pub fn classify_message(message: &str) -> FailureKind {
    if message.contains("429") || body_mentions_quota(message) {
        FailureKind::QuotaExhausted
    } else {
        FailureKind::General
    }
}

/// Classify an upstream error by HTTP status and response body.
///
/// 429 is always quota exhaustion. Other statuses are quota exhaustion only
/// when the body carries a quota marker.
pub fn classify_status(status: u16, body: &str) -> FailureKind {
    match status {
        429 => FailureKind::QuotaExhausted,
        _ if body_mentions_quota(body) => FailureKind::QuotaExhausted,
        _ => FailureKind::General,
    }
}

fn body_mentions_quota(body: &str) -> bool {
    let lower = body.to_lowercase();
    QUOTA_BODY_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// A failed external call, classified by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub kind: FailureKind,
    pub message: String,
}

impl CallError {
    pub fn quota(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::QuotaExhausted,
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::General,
            message: message.into(),
        }
    }

    /// Build from a message, classifying it with `classify_message`.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_message(&message),
            message,
        }
    }

    pub fn is_quota(&self) -> bool {
        self.kind == FailureKind::QuotaExhausted
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind.label(), self.message)
    }
}

impl std::error::Error for CallError {}
