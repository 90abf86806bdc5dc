//! In-memory components for handler tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use crate::credentials::{parse_secret_payload, Credential, CredentialProvider};
use crate::error::TransferError;
use crate::sftp::path_utils::staging_path;
use crate::sftp::session::{rename_over, RenameFailure, RenameOps};
use crate::sftp::{RemoteSession, RemoteTransport, StagedFile, WriteMode};
use crate::store::{check_ceiling, FetchedObject, ObjectBody, ObjectFetcher};
use crate::transfer::retry::Sleeper;

/// Object store backed by a map, with queued failures
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    failures: Mutex<VecDeque<TransferError>>,
    ceiling: Option<u64>,
    fetches: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, bucket: &str, key: &str, content: &[u8]) -> Self {
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), content.to_vec());
        self
    }

    pub fn with_ceiling(mut self, limit: u64) -> Self {
        self.ceiling = Some(limit);
        self
    }

    pub fn remove(&self, bucket: &str, key: &str) {
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
    }

    /// Fail the next fetch with `error`
    pub fn fail_next(&self, error: TransferError) {
        self.failures.lock().push_back(error);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectFetcher for MemoryObjectStore {
    async fn fetch(&self, store_name: &str, object_key: &str) -> Result<FetchedObject, TransferError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let content = self
            .objects
            .lock()
            .get(&(store_name.to_string(), object_key.to_string()))
            .cloned()
            .ok_or_else(|| {
                TransferError::ObjectNotFound(format!("{}/{}", store_name, object_key))
            })?;

        let size = content.len() as u64;
        check_ceiling(size, self.ceiling)?;

        let body: ObjectBody = Box::pin(std::io::Cursor::new(content));
        Ok(FetchedObject { size, body })
    }
}

/// Credential provider returning a fixed secret payload
pub struct StaticCredentials {
    payload: String,
    failures: Mutex<VecDeque<TransferError>>,
    resolves: AtomicUsize,
}

impl StaticCredentials {
    pub fn new(payload: &str) -> Self {
        Self {
            payload: payload.to_string(),
            failures: Mutex::new(VecDeque::new()),
            resolves: AtomicUsize::new(0),
        }
    }

    pub fn valid() -> Self {
        Self::new(
            r#"{"host":"sftp.partner.test","port":22,"username":"relay","password":"hunter2"}"#,
        )
    }

    /// Fail the next resolve with `error`
    pub fn fail_next(&self, error: TransferError) {
        self.failures.lock().push_back(error);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn resolve(&self, secret_id: &str) -> Result<Credential, TransferError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        parse_secret_payload(secret_id, &self.payload)
    }
}

struct WriteFault {
    after_bytes: usize,
    error: TransferError,
}

struct RemoteState {
    files: HashMap<String, Vec<u8>>,
    open_failures: VecDeque<TransferError>,
    write_faults: VecDeque<WriteFault>,
    commit_failures: VecDeque<TransferError>,
    rename_supported: bool,
    write_delay: Option<Duration>,
    commit_delay: Option<Duration>,
    cleanup_delay: Option<Duration>,
    open_calls: usize,
    opened: usize,
    closed: usize,
}

/// Remote filesystem held in memory
///
/// Clones share state, so a test keeps one handle while the handler owns
/// another.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                files: HashMap::new(),
                open_failures: VecDeque::new(),
                write_faults: VecDeque::new(),
                commit_failures: VecDeque::new(),
                rename_supported: true,
                write_delay: None,
                commit_delay: None,
                cleanup_delay: None,
                open_calls: 0,
                opened: 0,
                closed: 0,
            })),
        }
    }

    /// Fail the next open with `error`
    pub fn fail_open(&self, error: TransferError) {
        self.state.lock().open_failures.push_back(error);
    }

    /// Fail the next write after `after_bytes` bytes reached the remote path
    pub fn fail_write_after(&self, after_bytes: usize, error: TransferError) {
        self.state
            .lock()
            .write_faults
            .push_back(WriteFault { after_bytes, error });
    }

    pub fn disable_rename(&self) {
        self.state.lock().rename_supported = false;
    }

    /// Fail the next commit with `error`, leaving the temp file in place
    pub fn fail_commit(&self, error: TransferError) {
        self.state.lock().commit_failures.push_back(error);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().write_delay = Some(delay);
    }

    pub fn set_commit_delay(&self, delay: Duration) {
        self.state.lock().commit_delay = Some(delay);
    }

    /// Stall every discard and close by `delay`
    pub fn set_cleanup_delay(&self, delay: Duration) {
        self.state.lock().cleanup_delay = Some(delay);
    }

    pub fn put(&self, path: &str, content: &[u8]) {
        self.state
            .lock()
            .files
            .insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    pub fn files(&self) -> HashMap<String, Vec<u8>> {
        self.state.lock().files.clone()
    }

    pub fn open_calls(&self) -> usize {
        self.state.lock().open_calls
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }
}

#[async_trait]
impl RemoteTransport for MemoryRemote {
    async fn open(&self, _credential: &Credential) -> Result<Box<dyn RemoteSession>, TransferError> {
        {
            let mut state = self.state.lock();
            state.open_calls += 1;
            if let Some(error) = state.open_failures.pop_front() {
                return Err(error);
            }
            state.opened += 1;
        }

        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<RemoteState>>,
    closed: bool,
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn stage(
        &mut self,
        destination: &str,
        body: &mut ObjectBody,
        expected_size: u64,
        mode: WriteMode,
    ) -> Result<StagedFile, TransferError> {
        let path = match mode {
            WriteMode::Staged => staging_path(destination),
            WriteMode::Direct => destination.to_string(),
        };

        let delay = self.state.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut content = Vec::new();
        body.read_to_end(&mut content)
            .await
            .map_err(|e| TransferError::interrupted(e.to_string()))?;

        let mut state = self.state.lock();

        // A failed write leaves whatever reached the server behind
        if let Some(fault) = state.write_faults.pop_front() {
            let partial = content[..fault.after_bytes.min(content.len())].to_vec();
            state.files.insert(path, partial);
            return Err(fault.error);
        }

        if content.len() as u64 != expected_size {
            return Err(TransferError::interrupted(format!(
                "source ended after {} of {} bytes",
                content.len(),
                expected_size
            )));
        }

        let bytes_written = content.len() as u64;
        state.files.insert(path.clone(), content);

        Ok(StagedFile {
            final_path: destination.to_string(),
            temp_path: (mode == WriteMode::Staged).then_some(path),
            bytes_written,
        })
    }

    async fn commit(&mut self, staged: &StagedFile) -> Result<(), TransferError> {
        let Some(temp_path) = staged.temp_path.as_deref() else {
            return Ok(());
        };

        let delay = self.state.lock().commit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.state.lock().commit_failures.pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        match rename_over(&*self, temp_path, &staged.final_path).await {
            Err(e @ TransferError::AtomicRenameUnsupported(_)) => {
                self.state.lock().files.remove(temp_path);
                Err(e)
            }
            other => other,
        }
    }

    async fn discard(&mut self, staged: &StagedFile) {
        self.stall_cleanup().await;
        if let Some(temp_path) = staged.temp_path.as_deref() {
            self.state.lock().files.remove(temp_path);
        }
    }

    async fn close(&mut self) -> Result<(), TransferError> {
        if !self.closed {
            self.closed = true;
            self.state.lock().closed += 1;
        }
        self.stall_cleanup().await;
        Ok(())
    }
}

impl MemorySession {
    async fn stall_cleanup(&self) {
        let delay = self.state.lock().cleanup_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Renames behave like an SFTPv3 server: no overwriting an existing file
#[async_trait]
impl RenameOps for MemorySession {
    async fn rename_path(&self, from: &str, to: &str) -> Result<(), RenameFailure> {
        let mut state = self.state.lock();
        if !state.rename_supported {
            return Err(RenameFailure::Unsupported(
                "memory remote: rename disabled".into(),
            ));
        }
        if state.files.contains_key(to) {
            return Err(RenameFailure::Other(TransferError::rejected(format!(
                "{}: Failure",
                to
            ))));
        }
        let content = state.files.remove(from).ok_or_else(|| {
            RenameFailure::Other(TransferError::rejected(format!("{}: NoSuchFile", from)))
        })?;
        state.files.insert(to.to_string(), content);
        Ok(())
    }

    async fn path_exists(&self, path: &str) -> bool {
        self.state.lock().files.contains_key(path)
    }

    async fn remove_path(&self, path: &str) -> Result<(), TransferError> {
        self.state
            .lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| TransferError::rejected(format!("{}: NoSuchFile", path)))
    }
}

/// Records requested delays and returns immediately
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().push(delay);
    }
}
