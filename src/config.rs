//! Relay configuration
//!
//! Read once at invocation start and never mutated. The handler receives it
//! behind an `Arc`, so concurrent invocations in one process cannot interfere.

use std::str::FromStr;
use std::time::Duration;

use crate::transfer::retry::RetryConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

pub const SECRET_ID_KEY: &str = "RELAY_SECRET_ID";
pub const DESTINATION_TEMPLATE_KEY: &str = "RELAY_DESTINATION_TEMPLATE";
pub const RETRY_MAX_ATTEMPTS_KEY: &str = "RELAY_RETRY_MAX_ATTEMPTS";
pub const RETRY_INITIAL_BACKOFF_KEY: &str = "RELAY_RETRY_INITIAL_BACKOFF_MS";
pub const RETRY_MULTIPLIER_KEY: &str = "RELAY_RETRY_BACKOFF_MULTIPLIER";
pub const RETRY_MAX_BACKOFF_KEY: &str = "RELAY_RETRY_MAX_BACKOFF_MS";
pub const DEADLINE_KEY: &str = "RELAY_DEADLINE_SECS";
pub const CLEANUP_MARGIN_KEY: &str = "RELAY_CLEANUP_MARGIN_SECS";
pub const CONNECT_TIMEOUT_KEY: &str = "RELAY_CONNECT_TIMEOUT_SECS";
pub const IO_TIMEOUT_KEY: &str = "RELAY_IO_TIMEOUT_SECS";
pub const MAX_OBJECT_BYTES_KEY: &str = "RELAY_MAX_OBJECT_BYTES";
pub const HOST_KEY_FINGERPRINT_KEY: &str = "RELAY_HOST_KEY_FINGERPRINT";
pub const ATOMIC_RENAME_KEY: &str = "RELAY_ATOMIC_RENAME";

/// Complete relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Secret store identifier holding {host, port, username, password}
    pub secret_id: String,

    /// Remote path template; supports `{basename}`, `{key}` and `{bucket}`
    pub destination_template: String,

    /// Backoff policy shared by every retryable step
    pub retry: RetryConfig,

    /// Overall invocation deadline, shorter than the caller's own timeout
    pub deadline: Duration,

    /// Time reserved for closing the session after the deadline fires
    pub cleanup_margin: Duration,

    /// SSH connect + handshake timeout
    pub connect_timeout: Duration,

    /// Per-chunk remote write timeout
    pub io_timeout: Duration,

    /// ObjectTooLarge ceiling; `None` means unlimited
    pub max_object_bytes: Option<u64>,

    /// Pinned `SHA256:` host key fingerprint
    pub host_key_fingerprint: Option<String>,

    /// Stage to a temp path and rename. `false` writes straight to the final path.
    pub atomic_rename: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            secret_id: String::new(),
            destination_template: default_destination_template(),
            retry: RetryConfig::default(),
            deadline: Duration::from_secs(840),
            cleanup_margin: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(60),
            max_object_bytes: None,
            host_key_fingerprint: None,
            atomic_rename: true,
        }
    }
}

fn default_destination_template() -> String {
    "{basename}".to_string()
}

impl RelayConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = Self::default();

        let secret_id = get(SECRET_ID_KEY).ok_or(ConfigError::Missing(SECRET_ID_KEY))?;
        let destination_template =
            get(DESTINATION_TEMPLATE_KEY).unwrap_or(defaults.destination_template);

        let retry = RetryConfig {
            max_attempts: parse_or(&get, RETRY_MAX_ATTEMPTS_KEY, defaults.retry.max_attempts)?,
            initial_backoff: parse_millis_or(
                &get,
                RETRY_INITIAL_BACKOFF_KEY,
                defaults.retry.initial_backoff,
            )?,
            backoff_multiplier: parse_or(
                &get,
                RETRY_MULTIPLIER_KEY,
                defaults.retry.backoff_multiplier,
            )?,
            max_backoff: parse_millis_or(&get, RETRY_MAX_BACKOFF_KEY, defaults.retry.max_backoff)?,
        };

        let config = Self {
            secret_id,
            destination_template,
            retry,
            deadline: parse_secs_or(&get, DEADLINE_KEY, defaults.deadline)?,
            cleanup_margin: parse_secs_or(&get, CLEANUP_MARGIN_KEY, defaults.cleanup_margin)?,
            connect_timeout: parse_secs_or(&get, CONNECT_TIMEOUT_KEY, defaults.connect_timeout)?,
            io_timeout: parse_secs_or(&get, IO_TIMEOUT_KEY, defaults.io_timeout)?,
            max_object_bytes: get(MAX_OBJECT_BYTES_KEY)
                .map(|v| parse_value(MAX_OBJECT_BYTES_KEY, &v))
                .transpose()?,
            host_key_fingerprint: get(HOST_KEY_FINGERPRINT_KEY),
            atomic_rename: parse_or(&get, ATOMIC_RENAME_KEY, defaults.atomic_rename)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validation for all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_id.is_empty() {
            return Err(ConfigError::Missing(SECRET_ID_KEY));
        }

        if self.destination_template.is_empty() || self.destination_template.ends_with('/') {
            return Err(ConfigError::Invalid {
                key: DESTINATION_TEMPLATE_KEY,
                reason: "template must name a file, not a directory".into(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: RETRY_MAX_ATTEMPTS_KEY,
                reason: "at least one attempt is required".into(),
            });
        }

        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Invalid {
                key: RETRY_MULTIPLIER_KEY,
                reason: "multiplier must be >= 1.0".into(),
            });
        }

        if self.deadline <= self.cleanup_margin {
            return Err(ConfigError::Invalid {
                key: DEADLINE_KEY,
                reason: format!(
                    "deadline {:?} must exceed cleanup margin {:?}",
                    self.deadline, self.cleanup_margin
                ),
            });
        }

        if let Some(fp) = &self.host_key_fingerprint {
            if !fp.starts_with("SHA256:") {
                return Err(ConfigError::Invalid {
                    key: HOST_KEY_FINGERPRINT_KEY,
                    reason: "expected SHA256:<base64> fingerprint".into(),
                });
            }
        }

        Ok(())
    }

    /// Time the handler may spend before it must start cleaning up
    pub fn working_budget(&self) -> Duration {
        self.deadline.saturating_sub(self.cleanup_margin)
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: format!("{:?}: {}", raw, e),
    })
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_secs_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

fn parse_millis_or<G>(
    get: &G,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_millis() as u64).map(Duration::from_millis)
}
