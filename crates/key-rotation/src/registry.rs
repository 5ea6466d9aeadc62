//! Credential × model combination registry
//!
//! Holds the immutable credential and model lists loaded at startup. A
//! combination is never stored on its own: it is a pair of indices, or
//! equivalently a linear index `credential + model * K`. Linear order is
//! credential-major, so every credential is tried under the best model before
//! the next model is considered.

use std::fmt;

use common::Secret;
use serde::Serialize;

use crate::error::{Error, Result};

/// One API credential, identified by its position in the configured list.
///
/// The key itself is wrapped in `Secret` so it never reaches logs or the
/// usage snapshot; `label` is what gets displayed.
#[derive(Debug, Clone)]
pub struct Credential {
    label: String,
    key: Secret<String>,
}

impl Credential {
    pub fn new(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key: Secret::new(key.into()),
        }
    }

    /// Display name for logs and stats (e.g. "key-1").
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Expose the raw key for request signing.
    pub fn key(&self) -> &str {
        self.key.expose()
    }

    /// Masked key for logs: only the last four characters.
    pub fn hint(&self) -> String {
        self.key.hint()
    }
}

/// A (credential, model) pair addressed by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Combination {
    pub credential: usize,
    pub model: usize,
}

impl Combination {
    pub const FIRST: Combination = Combination {
        credential: 0,
        model: 0,
    };

    pub fn new(credential: usize, model: usize) -> Self {
        Self { credential, model }
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.credential, self.model)
    }
}

/// Immutable cross product of K credentials and M models.
#[derive(Debug)]
pub struct Registry {
    credentials: Vec<Credential>,
    models: Vec<String>,
}

impl Registry {
    /// Build a registry. Models are ordered best to worst.
    ///
    /// Fails with `Configuration` if either list is empty.
    pub fn new(credentials: Vec<Credential>, models: Vec<String>) -> Result<Self> {
        if credentials.is_empty() {
            return Err(Error::Configuration("no credentials configured".into()));
        }
        if models.is_empty() {
            return Err(Error::Configuration("no models configured".into()));
        }
        Ok(Self {
            credentials,
            models,
        })
    }

    /// `(K, M)`.
    pub fn size(&self) -> (usize, usize) {
        (self.credentials.len(), self.models.len())
    }

    /// Number of combinations, `K * M`.
    pub fn total(&self) -> usize {
        self.credentials.len() * self.models.len()
    }

    /// Credential and model for a combination.
    ///
    /// Combinations are only produced by this registry, so indices are always
    /// in range.
    pub fn get(&self, combination: Combination) -> (&Credential, &str) {
        (
            &self.credentials[combination.credential],
            &self.models[combination.model],
        )
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// Combination at a linear position, wrapping modulo `K * M`.
    pub fn combination_at(&self, index: usize) -> Combination {
        let k = self.credentials.len();
        let index = index % self.total();
        Combination::new(index % k, index / k)
    }

    /// Every combination in rotation order.
    pub fn combinations(&self) -> impl Iterator<Item = Combination> + '_ {
        (0..self.total()).map(|i| self.combination_at(i))
    }
}
