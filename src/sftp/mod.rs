//! Remote transport
//!
//! [`RemoteTransport::open`] performs the SSH handshake and password login and
//! yields a [`RemoteSession`]. A session stages bytes under a temporary name,
//! commits them with a rename, and must be closed on every exit path.

pub mod client;
pub mod path_utils;
pub mod session;

use async_trait::async_trait;

use crate::credentials::Credential;
use crate::error::TransferError;
use crate::store::ObjectBody;

pub use client::SftpTransport;
pub use session::SftpRemoteSession;

/// How bytes reach the final destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write a temp sibling, then rename over the final path
    Staged,
    /// Write the final path directly; a failed transfer can leave a partial file
    Direct,
}

/// Bytes fully written remotely but not yet visible under the final name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub final_path: String,
    /// `None` in [`WriteMode::Direct`], where there is nothing to commit
    pub temp_path: Option<String>,
    pub bytes_written: u64,
}

/// Opens authenticated sessions to the remote endpoint
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Signals `AuthenticationFailed`, `ConnectionFailed`, `ConnectionTimeout`
    /// or `HostKeyRejected`.
    async fn open(&self, credential: &Credential) -> Result<Box<dyn RemoteSession>, TransferError>;
}

/// One authenticated session, exclusively owned by one invocation
#[async_trait]
pub trait RemoteSession: Send {
    /// Stream exactly `expected_size` bytes from `body` toward `destination`.
    ///
    /// On failure the temp file is removed best-effort; the final path is
    /// never touched in [`WriteMode::Staged`].
    async fn stage(
        &mut self,
        destination: &str,
        body: &mut ObjectBody,
        expected_size: u64,
        mode: WriteMode,
    ) -> Result<StagedFile, TransferError>;

    /// Make staged bytes visible under the final name, replacing any existing file.
    ///
    /// Returns `AtomicRenameUnsupported` (after removing the temp file) when the
    /// server cannot rename.
    async fn commit(&mut self, staged: &StagedFile) -> Result<(), TransferError>;

    /// Best-effort removal of a staged temp file
    async fn discard(&mut self, staged: &StagedFile);

    /// Release the session. Safe to call more than once.
    async fn close(&mut self) -> Result<(), TransferError>;
}
