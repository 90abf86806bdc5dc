//! SFTP transport using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::*;
use russh_sftp::client::SftpSession as RusshSftpSession;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::session::SftpRemoteSession;
use super::{RemoteSession, RemoteTransport};
use crate::config::RelayConfig;
use crate::credentials::Credential;
use crate::error::TransferError;

/// Opens password-authenticated SFTP sessions
#[derive(Debug, Clone)]
pub struct SftpTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
    host_key_fingerprint: Option<String>,
}

impl SftpTransport {
    pub fn new(
        connect_timeout: Duration,
        io_timeout: Duration,
        host_key_fingerprint: Option<String>,
    ) -> Self {
        Self {
            connect_timeout,
            io_timeout,
            host_key_fingerprint,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            config.connect_timeout,
            config.io_timeout,
            config.host_key_fingerprint.clone(),
        )
    }

    async fn connect(
        &self,
        credential: &Credential,
        endpoint: &str,
    ) -> Result<client::Handle<HostKeyVerifier>, TransferError> {
        let socket_addr = tokio::net::lookup_host((credential.host.as_str(), credential.port))
            .await
            .map_err(|e| {
                TransferError::ConnectionFailed(format!("Failed to resolve {}: {}", endpoint, e))
            })?
            .next()
            .ok_or_else(|| {
                TransferError::ConnectionFailed(format!("No address found for {}", endpoint))
            })?;

        let ssh_config = client::Config {
            inactivity_timeout: Some(self.io_timeout * 2),
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = HostKeyVerifier::new(
            credential.host.clone(),
            credential.port,
            self.host_key_fingerprint.clone(),
        );

        client::connect(Arc::new(ssh_config), socket_addr, handler)
            .await
            .map_err(|e| match e {
                Error::UnknownKey => TransferError::HostKeyRejected(format!(
                    "{} presented a host key that does not match the pinned fingerprint",
                    endpoint
                )),
                other => TransferError::ConnectionFailed(format!("{}: {}", endpoint, other)),
            })
    }
}

#[async_trait]
impl RemoteTransport for SftpTransport {
    async fn open(&self, credential: &Credential) -> Result<Box<dyn RemoteSession>, TransferError> {
        let endpoint = credential.endpoint();
        info!("Connecting to SFTP server at {}", endpoint);

        // Connect with timeout
        let mut handle = tokio::time::timeout(self.connect_timeout, self.connect(credential, &endpoint))
            .await
            .map_err(|_| {
                TransferError::ConnectionTimeout(format!(
                    "{}: no handshake within {:?}",
                    endpoint, self.connect_timeout
                ))
            })??;

        debug!("SSH handshake completed with {}", endpoint);

        // Authenticate
        let authenticated = tokio::time::timeout(
            self.connect_timeout,
            handle.authenticate_password(&credential.username, credential.secret()),
        )
        .await
        .map_err(|_| {
            TransferError::ConnectionTimeout(format!("{}: authentication timed out", endpoint))
        })?
        .map_err(|e| TransferError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;

        if !authenticated.success() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(TransferError::AuthenticationFailed(format!(
                "{} rejected password login for {}",
                endpoint, credential.username
            )));
        }

        info!("SSH authentication successful for {}@{}", credential.username, endpoint);

        // Request SFTP subsystem on a fresh channel
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TransferError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| {
                TransferError::rejected(format!(
                    "{}: SFTP subsystem not available: {}",
                    endpoint, e
                ))
            })?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransferError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;

        info!("SFTP subsystem opened on {}", endpoint);

        Ok(Box::new(SftpRemoteSession::new(
            handle,
            sftp,
            endpoint,
            self.io_timeout,
        )))
    }
}

/// Client handler for russh callbacks
///
/// With a pinned fingerprint, any other host key aborts the handshake.
/// Without one, every key is accepted and its fingerprint logged so it can be
/// pinned later.
pub struct HostKeyVerifier {
    host: String,
    port: u16,
    pinned: Option<String>,
}

impl HostKeyVerifier {
    pub fn new(host: String, port: u16, pinned: Option<String>) -> Self {
        Self { host, port, pinned }
    }
}

impl client::Handler for HostKeyVerifier {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);

        match &self.pinned {
            Some(expected) if fingerprints_match(expected, &actual) => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Some(expected) => {
                warn!(
                    "HOST KEY MISMATCH for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected, actual
                );
                Ok(false)
            }
            None => {
                info!(
                    "Accepting host key for {}:{} (fingerprint: {})",
                    self.host, self.port, actual
                );
                Ok(true)
            }
        }
    }
}

/// Compute SHA256 fingerprint of public key
pub fn fingerprint(key: &PublicKey) -> String {
    let key_bytes = key.public_key_bytes();
    let mut hasher = Sha256::new();
    hasher.update(&key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Compare fingerprints, tolerating base64 padding on the pinned value
pub fn fingerprints_match(expected: &str, actual: &str) -> bool {
    expected.trim().trim_end_matches('=') == actual.trim_end_matches('=')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprints_match() {
        let actual = "SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8";
        assert!(fingerprints_match(actual, actual));
        assert!(fingerprints_match(
            "SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8=",
            actual
        ));
        assert!(fingerprints_match(
            " SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8 ",
            actual
        ));
        assert!(!fingerprints_match("SHA256:other", actual));
    }

    #[test]
    fn test_transport_from_config() {
        let config = RelayConfig {
            secret_id: "s".into(),
            connect_timeout: Duration::from_secs(7),
            host_key_fingerprint: Some("SHA256:abc".into()),
            ..Default::default()
        };
        let transport = SftpTransport::from_config(&config);
        assert_eq!(transport.connect_timeout, Duration::from_secs(7));
        assert_eq!(transport.host_key_fingerprint.as_deref(), Some("SHA256:abc"));
    }
}
