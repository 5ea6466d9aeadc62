//! Error types for rotation operations

/// Errors surfaced by the rotation manager and the driving loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Empty credential or model list. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// General failures exceeded the retry budget of the driving loop.
    #[error("all retries exhausted after {attempts} attempts: {last_error}")]
    AllRetriesExhausted { attempts: usize, last_error: String },
}

/// Result alias for rotation operations.
pub type Result<T> = std::result::Result<T, Error>;
