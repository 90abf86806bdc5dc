//! SFTP Session management
//!
//! Stages uploads under a `.relay-part` sibling and renames them into place
//! once every byte has been acknowledged.

use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use russh::Disconnect;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::client::HostKeyVerifier;
use super::path_utils::staging_path;
use super::{RemoteSession, StagedFile, WriteMode};
use crate::error::TransferError;
use crate::store::ObjectBody;

/// 64 KB chunks
const CHUNK_SIZE: usize = 65536;

/// SFTP Session wrapper
pub struct SftpRemoteSession {
    handle: Option<Handle<HostKeyVerifier>>,
    sftp: Option<RusshSftpSession>,
    endpoint: String,
    io_timeout: Duration,
}

impl SftpRemoteSession {
    pub fn new(
        handle: Handle<HostKeyVerifier>,
        sftp: RusshSftpSession,
        endpoint: String,
        io_timeout: Duration,
    ) -> Self {
        Self {
            handle: Some(handle),
            sftp: Some(sftp),
            endpoint,
            io_timeout,
        }
    }

    fn sftp(&self) -> Result<&RusshSftpSession, TransferError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| TransferError::interrupted(format!("{}: session closed", self.endpoint)))
    }

    async fn upload(
        &self,
        path: &str,
        body: &mut ObjectBody,
        expected_size: u64,
    ) -> Result<u64, TransferError> {
        // Create remote file (truncate if exists)
        let mut remote_file = self
            .sftp()?
            .create(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        pump(body, &mut remote_file, expected_size, self.io_timeout, path).await
    }

    async fn remove_quietly(&self, path: &str) {
        let Ok(sftp) = self.sftp() else { return };
        if let Err(e) = sftp.remove_file(path).await {
            warn!("Failed to remove {} on {}: {}", path, self.endpoint, e);
        }
    }
}

#[async_trait]
impl RemoteSession for SftpRemoteSession {
    async fn stage(
        &mut self,
        destination: &str,
        body: &mut ObjectBody,
        expected_size: u64,
        mode: WriteMode,
    ) -> Result<StagedFile, TransferError> {
        match mode {
            WriteMode::Staged => {
                let temp_path = staging_path(destination);
                debug!("Staging {} bytes to {}", expected_size, temp_path);

                match self.upload(&temp_path, body, expected_size).await {
                    Ok(bytes_written) => Ok(StagedFile {
                        final_path: destination.to_string(),
                        temp_path: Some(temp_path),
                        bytes_written,
                    }),
                    Err(e) => {
                        self.remove_quietly(&temp_path).await;
                        Err(e)
                    }
                }
            }
            WriteMode::Direct => {
                warn!(
                    "Degraded mode: writing {} directly, a failure can leave a partial file",
                    destination
                );
                let bytes_written = self.upload(destination, body, expected_size).await?;
                Ok(StagedFile {
                    final_path: destination.to_string(),
                    temp_path: None,
                    bytes_written,
                })
            }
        }
    }

    async fn commit(&mut self, staged: &StagedFile) -> Result<(), TransferError> {
        let Some(temp_path) = staged.temp_path.as_deref() else {
            return Ok(());
        };
        let final_path = staged.final_path.as_str();
        let sftp = self.sftp()?;

        info!("Upload complete, renaming {} to {}", temp_path, final_path);

        match rename_over(sftp, temp_path, final_path).await {
            Err(TransferError::AtomicRenameUnsupported(reason)) => {
                self.remove_quietly(temp_path).await;
                Err(TransferError::AtomicRenameUnsupported(format!(
                    "{}: {}",
                    self.endpoint, reason
                )))
            }
            other => other,
        }
    }

    async fn discard(&mut self, staged: &StagedFile) {
        if let Some(temp_path) = staged.temp_path.as_deref() {
            self.remove_quietly(temp_path).await;
        }
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        // Dropping the SFTP session closes its channel
        drop(self.sftp.take());

        if let Some(handle) = self.handle.take() {
            handle
                .disconnect(Disconnect::ByApplication, "Transfer finished", "en")
                .await
                .map_err(|e| {
                    TransferError::ConnectionFailed(format!("{}: {}", self.endpoint, e))
                })?;
            info!("SFTP session to {} closed", self.endpoint);
        }
        Ok(())
    }
}

impl Drop for SftpRemoteSession {
    fn drop(&mut self) {
        if self.handle.is_some() {
            // Dropping the handle tears the connection down without a disconnect message
            debug!("Dropping unclosed SFTP session to {}", self.endpoint);
        }
    }
}

/// Why a single rename request failed
#[derive(Debug)]
pub enum RenameFailure {
    /// The server does not implement rename at all
    Unsupported(String),
    Other(TransferError),
}

impl RenameFailure {
    fn into_error(self) -> TransferError {
        match self {
            RenameFailure::Unsupported(reason) => TransferError::AtomicRenameUnsupported(reason),
            RenameFailure::Other(e) => e,
        }
    }
}

/// The remote file operations a commit needs
#[async_trait]
pub trait RenameOps: Send + Sync {
    async fn rename_path(&self, from: &str, to: &str) -> Result<(), RenameFailure>;
    async fn path_exists(&self, path: &str) -> bool;
    async fn remove_path(&self, path: &str) -> Result<(), TransferError>;
}

#[async_trait]
impl RenameOps for RusshSftpSession {
    async fn rename_path(&self, from: &str, to: &str) -> Result<(), RenameFailure> {
        match self.rename(from, to).await {
            Ok(()) => Ok(()),
            Err(SftpErrorInner::Status(status)) if status.status_code == StatusCode::OpUnsupported => {
                Err(RenameFailure::Unsupported(status.error_message))
            }
            Err(e) => Err(RenameFailure::Other(map_sftp_error(e, to))),
        }
    }

    async fn path_exists(&self, path: &str) -> bool {
        self.try_exists(path).await.unwrap_or(false)
    }

    async fn remove_path(&self, path: &str) -> Result<(), TransferError> {
        self.remove_file(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }
}

/// Rename `temp_path` onto `final_path`, replacing an existing file.
///
/// SFTPv3 rename refuses to overwrite, so a failed rename onto an existing
/// path removes that path and tries once more. A server without rename
/// yields `AtomicRenameUnsupported`; the temp file is left to the caller.
pub async fn rename_over<R>(fs: &R, temp_path: &str, final_path: &str) -> Result<(), TransferError>
where
    R: RenameOps + ?Sized,
{
    let first = match fs.rename_path(temp_path, final_path).await {
        Ok(()) => return Ok(()),
        Err(RenameFailure::Unsupported(reason)) => {
            return Err(TransferError::AtomicRenameUnsupported(reason))
        }
        Err(RenameFailure::Other(e)) => e,
    };

    if !fs.path_exists(final_path).await {
        return Err(first);
    }

    debug!("Replacing existing {}", final_path);
    fs.remove_path(final_path).await?;
    fs.rename_path(temp_path, final_path)
        .await
        .map_err(RenameFailure::into_error)
}

/// Copy exactly `expected_size` bytes from `body` into `sink`, then flush and
/// shut the sink down. A source that ends early or runs long is a retryable
/// interruption; the object changed under us.
pub async fn pump<W>(
    body: &mut ObjectBody,
    sink: &mut W,
    expected_size: u64,
    io_timeout: Duration,
    path: &str,
) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut transferred: u64 = 0;

    loop {
        let bytes_read = body.read(&mut buffer).await.map_err(|e| {
            TransferError::interrupted(format!(
                "source read failed after {} bytes: {}",
                transferred, e
            ))
        })?;

        if bytes_read == 0 {
            break; // EOF
        }

        transferred += bytes_read as u64;
        if transferred > expected_size {
            return Err(TransferError::interrupted(format!(
                "source produced more than the reported {} bytes",
                expected_size
            )));
        }

        // Write with timeout to prevent zombie transfers
        match tokio::time::timeout(io_timeout, sink.write_all(&buffer[..bytes_read])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(map_io_error(e, path)),
            Err(_) => {
                warn!("Remote write timeout after {:?} at {} bytes", io_timeout, transferred);
                return Err(TransferError::interrupted(format!(
                    "remote write to {} timed out after {:?}",
                    path, io_timeout
                )));
            }
        }
    }

    if transferred != expected_size {
        return Err(TransferError::interrupted(format!(
            "source ended after {} of {} bytes",
            transferred, expected_size
        )));
    }

    // Flush and close the remote handle (with timeout)
    match tokio::time::timeout(io_timeout, async {
        sink.flush().await?;
        sink.shutdown().await
    })
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(map_io_error(e, path)),
        Err(_) => {
            return Err(TransferError::interrupted(format!(
                "remote flush of {} timed out after {:?}",
                path, io_timeout
            )))
        }
    }

    Ok(transferred)
}

/// Map SFTP errors to our error type
fn map_sftp_error(err: SftpErrorInner, path: &str) -> TransferError {
    match err {
        SftpErrorInner::Status(status) => match status.status_code {
            StatusCode::NoConnection | StatusCode::ConnectionLost => TransferError::interrupted(
                format!("{}: {}", path, status.error_message),
            ),
            // NoSuchFile (missing directory), PermissionDenied, Failure (quota,
            // disk full), BadMessage, OpUnsupported: retrying will not help
            _ => TransferError::rejected(format!(
                "{}: {:?} {}",
                path, status.status_code, status.error_message
            )),
        },
        other => TransferError::interrupted(format!("{}: {}", path, other)),
    }
}

/// Classify I/O errors raised while streaming to an open remote file
fn map_io_error(err: std::io::Error, path: &str) -> TransferError {
    let err_str = err.to_string();
    let lowered = err_str.to_lowercase();
    if err.kind() == std::io::ErrorKind::PermissionDenied
        || lowered.contains("permission denied")
        || lowered.contains("quota")
        || lowered.contains("no space")
    {
        TransferError::rejected(format!("{}: {}", path, err_str))
    } else {
        TransferError::interrupted(format!("{}: {}", path, err_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn body(bytes: &'static [u8]) -> ObjectBody {
        Box::pin(bytes)
    }

    /// Accepts `limit` bytes, then fails every write with `kind`
    struct FailingSink {
        written: Vec<u8>,
        limit: usize,
        kind: io::ErrorKind,
    }

    impl AsyncWrite for FailingSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.written.len() >= self.limit {
                return Poll::Ready(Err(io::Error::new(self.kind, "sink failure")));
            }
            let n = buf.len().min(self.limit - self.written.len());
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Rejects renames onto existing files, like an SFTPv3 server
    struct StrictRenameFs {
        files: Mutex<HashMap<String, Vec<u8>>>,
        rename_supported: bool,
        removals: Mutex<Vec<String>>,
    }

    impl StrictRenameFs {
        fn with_files(files: &[(&str, &str)]) -> Self {
            Self {
                files: Mutex::new(
                    files
                        .iter()
                        .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
                        .collect(),
                ),
                rename_supported: true,
                removals: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RenameOps for StrictRenameFs {
        async fn rename_path(&self, from: &str, to: &str) -> Result<(), RenameFailure> {
            if !self.rename_supported {
                return Err(RenameFailure::Unsupported("rename not implemented".into()));
            }
            let mut files = self.files.lock();
            if files.contains_key(to) {
                return Err(RenameFailure::Other(TransferError::rejected(format!(
                    "{}: Failure",
                    to
                ))));
            }
            let content = files.remove(from).ok_or_else(|| {
                RenameFailure::Other(TransferError::rejected(format!("{}: NoSuchFile", from)))
            })?;
            files.insert(to.to_string(), content);
            Ok(())
        }

        async fn path_exists(&self, path: &str) -> bool {
            self.files.lock().contains_key(path)
        }

        async fn remove_path(&self, path: &str) -> Result<(), TransferError> {
            self.removals.lock().push(path.to_string());
            self.files
                .lock()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| TransferError::rejected(format!("{}: NoSuchFile", path)))
        }
    }

    #[tokio::test]
    async fn test_rename_over_fresh_destination() {
        let fs = StrictRenameFs::with_files(&[("a.csv.1.relay-part", "new")]);

        rename_over(&fs, "a.csv.1.relay-part", "a.csv").await.unwrap();

        let files = fs.files.lock();
        assert_eq!(files.get("a.csv").map(Vec::as_slice), Some(&b"new"[..]));
        assert!(!files.contains_key("a.csv.1.relay-part"));
        assert!(fs.removals.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rename_over_replaces_existing_file() {
        let fs = StrictRenameFs::with_files(&[("a.csv", "old"), ("a.csv.1.relay-part", "new")]);

        rename_over(&fs, "a.csv.1.relay-part", "a.csv").await.unwrap();

        let files = fs.files.lock();
        assert_eq!(files.get("a.csv").map(Vec::as_slice), Some(&b"new"[..]));
        assert_eq!(files.len(), 1);
        assert_eq!(*fs.removals.lock(), vec!["a.csv".to_string()]);
    }

    #[tokio::test]
    async fn test_rename_over_missing_temp_reports_first_error() {
        let fs = StrictRenameFs::with_files(&[]);

        let err = rename_over(&fs, "a.csv.1.relay-part", "a.csv")
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::TransferInterrupted { retryable: false, .. }));
        assert!(fs.removals.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rename_over_unsupported() {
        let mut fs = StrictRenameFs::with_files(&[("a.csv", "old"), ("a.csv.1.relay-part", "new")]);
        fs.rename_supported = false;

        let err = rename_over(&fs, "a.csv.1.relay-part", "a.csv")
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::AtomicRenameUnsupported(_)));
        // Existing destination left alone
        assert_eq!(
            fs.files.lock().get("a.csv").map(Vec::as_slice),
            Some(&b"old"[..])
        );
        assert!(fs.removals.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pump_copies_exact_size() {
        let mut sink = Vec::new();
        let n = pump(&mut body(b"hello world"), &mut sink, 11, Duration::from_secs(5), "p")
            .await
            .unwrap();
        assert_eq!(n, 11);
        assert_eq!(sink, b"hello world");
    }

    #[tokio::test]
    async fn test_pump_empty_object() {
        let mut sink = Vec::new();
        let n = pump(&mut body(b""), &mut sink, 0, Duration::from_secs(5), "p")
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_pump_size_mismatch_is_retryable() {
        let mut sink = Vec::new();
        let err = pump(&mut body(b"short"), &mut sink, 10, Duration::from_secs(5), "p")
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let mut sink = Vec::new();
        let err = pump(&mut body(b"longer than said"), &mut sink, 3, Duration::from_secs(5), "p")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_pump_classifies_sink_errors() {
        let mut sink = FailingSink {
            written: Vec::new(),
            limit: 4,
            kind: io::ErrorKind::ConnectionReset,
        };
        let err = pump(&mut body(b"0123456789"), &mut sink, 10, Duration::from_secs(5), "p")
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let mut sink = FailingSink {
            written: Vec::new(),
            limit: 4,
            kind: io::ErrorKind::PermissionDenied,
        };
        let err = pump(&mut body(b"0123456789"), &mut sink, 10, Duration::from_secs(5), "p")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
