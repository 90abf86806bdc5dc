//! Connection credentials
//!
//! A [`Credential`] is resolved at most once per invocation and dropped when the
//! invocation ends. Nothing here caches across invocations, so a rotated
//! secret takes effect on the very next event.

mod secrets_manager;

use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};
use zeroize::Zeroizing;

use crate::error::TransferError;

pub use secrets_manager::SecretsManagerProvider;

/// Remote login for one invocation
pub struct Credential {
    pub host: String,
    pub port: u16,
    pub username: String,
    secret: Zeroizing<String>,
}

impl Credential {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    /// Password for the remote login. Never log this.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// `host:port`, safe to log
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Resolves a secret identifier to a [`Credential`]
///
/// Implementations classify failures as `CredentialNotFound`,
/// `CredentialMalformed` or `CredentialStoreUnavailable` and never retry on
/// their own.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, secret_id: &str) -> Result<Credential, TransferError>;
}

/// Parse a structured secret payload `{host, port, username, password|secret}`
///
/// `port` may be a JSON number or a decimal string, since key/value secret
/// editors store every value as a string. Error messages name the offending
/// field but never echo its value.
pub fn parse_secret_payload(secret_id: &str, payload: &str) -> Result<Credential, TransferError> {
    let malformed =
        |reason: &str| TransferError::CredentialMalformed(format!("{}: {}", secret_id, reason));

    let value: Value =
        serde_json::from_str(payload).map_err(|_| malformed("secret is not valid JSON"))?;
    let fields = value
        .as_object()
        .ok_or_else(|| malformed("secret is not a JSON object"))?;

    let host = required_string(fields, "host").map_err(|r| malformed(&r))?;
    let username = required_string(fields, "username").map_err(|r| malformed(&r))?;
    let secret = match fields.get("password") {
        Some(_) => required_string(fields, "password"),
        None => required_string(fields, "secret").map_err(|_| {
            "missing field \"password\" (or \"secret\")".to_string()
        }),
    }
    .map_err(|r| malformed(&r))?;

    let port = match fields.get("port") {
        None | Some(Value::Null) => return Err(malformed("missing field \"port\"")),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    }
    .filter(|p| (1..=65535).contains(p))
    .ok_or_else(|| malformed("field \"port\" must be an integer in 1..=65535"))?;

    Ok(Credential::new(host, port as u16, username, secret))
}

fn required_string(fields: &Map<String, Value>, name: &str) -> Result<String, String> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(format!("missing field \"{}\"", name)),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(format!("field \"{}\" is empty", name)),
        Some(_) => Err(format!("field \"{}\" must be a string", name)),
    }
}
