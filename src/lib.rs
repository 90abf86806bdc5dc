//! s3-sftp-relay - Relays newly created objects to a remote SFTP destination
//!
//! One event in, one [`TransferResult`] out. Each invocation fetches the
//! object, resolves a fresh credential, and writes it to the remote through
//! a temp file and rename.

pub mod config;
pub mod credentials;
pub mod error;
pub mod event;
pub mod sftp;
pub mod store;
pub mod transfer;

#[cfg(test)]
mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConfigError, RelayConfig};
pub use error::{ErrorCategory, ErrorKind, TransferError};
pub use event::TransferEvent;
pub use transfer::{Outcome, Stage, TransferHandler, TransferResult};

/// Initialize logging
///
/// Logs go to stderr; stdout carries the result line.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
