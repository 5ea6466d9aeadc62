//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys and Pushover tokens are read from environment variables named in
//! (or defaulted by) the config file, never stored in the TOML itself.

use common::Secret;
use key_rotation::Credential;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Free Gemini models, best first.
const DEFAULT_MODELS: &[&str] = &[
    "gemini-2.5-flash",
    "gemini-2.0-flash",
    "gemini-2.5-flash-lite",
    "gemini-2.0-flash-lite",
];

/// Environment variables holding API keys, in rotation order.
const DEFAULT_CREDENTIAL_ENV: &[&str] = &[
    "GOOGLE_API_KEY",
    "GOOGLE_API_KEY2",
    "GOOGLE_API_KEY3",
    "GOOGLE_API_KEY4",
];

const PUSHOVER_TOKEN_ENV: &str = "PUSHOVER_TOKEN";
const PUSHOVER_USER_ENV: &str = "PUSHOVER_USER";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rotation: RotationConfig,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
    /// Resolved from `rotation.credential_env` at load time.
    #[serde(skip)]
    pub credentials: Vec<Credential>,
}

/// Credential and model pool
#[derive(Debug, Deserialize)]
pub struct RotationConfig {
    /// Model identifiers ordered best to worst
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    /// Environment variables to read API keys from; unset ones are skipped
    #[serde(default = "default_credential_env")]
    pub credential_env: Vec<String>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            credential_env: default_credential_env(),
        }
    }
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    /// Timeout for a single upstream attempt
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Upper bound on the whole rotation loop for one inbound request
    #[serde(default = "default_request_deadline")]
    pub request_deadline_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Pushover alert settings. Token and user come from the environment.
#[derive(Debug, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_pushover_url")]
    pub api_url: String,
    #[serde(default = "default_title_prefix")]
    pub title_prefix: String,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
    #[serde(skip)]
    pub user: Option<Secret<String>>,
}

fn default_models() -> Vec<String> {
    DEFAULT_MODELS.iter().map(|m| m.to_string()).collect()
}

fn default_credential_env() -> Vec<String> {
    DEFAULT_CREDENTIAL_ENV.iter().map(|v| v.to_string()).collect()
}

fn default_upstream_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta/openai".into()
}

fn default_timeout() -> u64 {
    60
}

fn default_request_deadline() -> u64 {
    600
}

fn default_max_connections() -> usize {
    1000
}

fn default_pushover_url() -> String {
    "https://api.pushover.net/1/messages.json".into()
}

fn default_title_prefix() -> String {
    "Gemini Proxy".into()
}

/// Read a non-blank environment variable.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from a TOML file, then resolve secrets from the
    /// environment.
    ///
    /// Credentials keep the order of `credential_env`; unset or blank
    /// variables are skipped. Loading fails if none resolve.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.proxy.upstream_url.starts_with("http://")
            && !config.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                config.proxy.upstream_url
            )));
        }

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.request_deadline_secs == 0 {
            return Err(common::Error::Config(
                "request_deadline_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.rotation.models.is_empty() {
            return Err(common::Error::Config(
                "rotation.models must list at least one model".into(),
            ));
        }

        config.credentials = config
            .rotation
            .credential_env
            .iter()
            .filter_map(|var| env_value(var).map(|key| Credential::new(var.clone(), key)))
            .collect();
        if config.credentials.is_empty() {
            return Err(common::Error::MissingCredentials(
                config.rotation.credential_env.clone(),
            ));
        }

        if let Some(notify) = config.notify.as_mut() {
            notify.token = env_value(PUSHOVER_TOKEN_ENV).map(Secret::new);
            notify.user = env_value(PUSHOVER_USER_ENV).map(Secret::new);
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-proxy.toml")
    }
}
