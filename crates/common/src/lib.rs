//! Common types for the Gemini rotation workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
