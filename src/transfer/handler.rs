//! Transfer handler
//!
//! Drives one event through `Received → Fetching → Authenticating →
//! Transferring → Finalizing` and reports exactly one [`TransferResult`].
//! This is the only place retry and backoff decisions are made.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::retry::{next_delay, retry_with_backoff, within_deadline, Sleeper, TokioSleeper};
use super::types::{Outcome, Stage, TransferResult};
use crate::config::RelayConfig;
use crate::credentials::{Credential, CredentialProvider};
use crate::error::TransferError;
use crate::event::TransferEvent;
use crate::sftp::path_utils::render_destination;
use crate::sftp::{RemoteSession, RemoteTransport, StagedFile, WriteMode};
use crate::store::{FetchedObject, ObjectFetcher};

/// Stateless per-event handler
///
/// Holds only immutable configuration and component handles; every
/// invocation resolves its own credential and opens its own session.
pub struct TransferHandler {
    config: Arc<RelayConfig>,
    fetcher: Arc<dyn ObjectFetcher>,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn RemoteTransport>,
    sleeper: Arc<dyn Sleeper>,
}

/// Mutable bookkeeping for a single invocation
struct Invocation {
    event_id: String,
    stage: Stage,
    attempts: u32,
    degraded: bool,
    /// Working deadline; every step must finish by then
    deadline: Instant,
    /// Hard end of the invocation; cleanup must finish by then
    cutoff: Instant,
}

impl Invocation {
    fn enter(&mut self, stage: Stage) {
        if self.stage == stage {
            return;
        }
        info!(
            "[{}] {} -> {}",
            self.event_id,
            self.stage.as_str(),
            stage.as_str()
        );
        self.stage = stage;
    }
}

impl TransferHandler {
    pub fn new(
        config: Arc<RelayConfig>,
        fetcher: Arc<dyn ObjectFetcher>,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        Self {
            config,
            fetcher,
            credentials,
            transport,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the backoff clock
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Handle one inbound event. Never panics; always returns one result.
    pub async fn handle(&self, raw: &Value) -> TransferResult {
        let started = Instant::now();
        let mut result = TransferResult {
            event_id: None,
            store_name: None,
            object_key: String::new(),
            destination: None,
            bytes_written: 0,
            outcome: Outcome::Failed,
            error_kind: None,
            error_category: None,
            error_detail: None,
            failed_stage: None,
            attempts: 0,
            degraded: false,
            elapsed_ms: 0,
        };

        let event = match TransferEvent::parse(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!("Rejecting event: {}", e);
                result.record_failure(&e, Stage::Received);
                result.elapsed_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };

        result.event_id = Some(event.event_id.clone());
        result.store_name = Some(event.store_name.clone());
        result.object_key = event.object_key.clone();

        info!(
            "[{}] Received {}/{}",
            event.event_id, event.store_name, event.object_key
        );

        let mut invocation = Invocation {
            event_id: event.event_id.clone(),
            stage: Stage::Received,
            attempts: 0,
            degraded: false,
            deadline: started + self.config.working_budget(),
            cutoff: started + self.config.deadline,
        };

        match self.run(&event, &mut invocation, &mut result).await {
            Ok(bytes_written) => {
                invocation.enter(Stage::Succeeded);
                result.outcome = Outcome::Success;
                result.bytes_written = bytes_written;
            }
            Err(e) => {
                let stage = invocation.stage;
                invocation.enter(Stage::Failed);
                result.record_failure(&e, stage);
                error!(
                    "[{}] Transfer of {} failed during {} ({:?}, {:?}): {}",
                    event.event_id,
                    event.object_key,
                    stage.as_str(),
                    e.kind(),
                    e.kind().category(),
                    e
                );
            }
        }

        result.attempts = invocation.attempts;
        result.degraded = invocation.degraded;
        result.elapsed_ms = started.elapsed().as_millis() as u64;

        if result.is_success() {
            info!(
                "[{}] Transferred {} bytes to {} in {} ms",
                event.event_id,
                result.bytes_written,
                result.destination.as_deref().unwrap_or_default(),
                result.elapsed_ms
            );
        }

        result
    }

    async fn run(
        &self,
        event: &TransferEvent,
        invocation: &mut Invocation,
        result: &mut TransferResult,
    ) -> Result<u64, TransferError> {
        let destination = render_destination(&self.config.destination_template, event)?;
        result.destination = Some(destination.clone());

        invocation.enter(Stage::Fetching);
        let mut pending = Some(self.fetch(event, invocation).await?);

        invocation.enter(Stage::Authenticating);
        let credential = self.resolve_credential(invocation).await?;

        let mut mode = if self.config.atomic_rename {
            WriteMode::Staged
        } else {
            warn!(
                "[{}] Atomic rename disabled by configuration, writing {} directly",
                invocation.event_id, destination
            );
            invocation.degraded = true;
            WriteMode::Direct
        };

        let mut attempt = 0;
        loop {
            // The body is consumed by each attempt
            let mut object = match pending.take() {
                Some(object) => object,
                None => {
                    invocation.enter(Stage::Fetching);
                    self.fetch(event, invocation).await?
                }
            };

            invocation.enter(Stage::Authenticating);
            let mut session = self.open_session(&credential, invocation).await?;

            attempt += 1;
            invocation.attempts += 1;
            invocation.enter(Stage::Transferring);

            let delivered = self
                .deliver(session.as_mut(), &destination, &mut object, mode, invocation)
                .await;
            self.close_session(session.as_mut(), invocation).await;

            let err = match delivered {
                Ok(bytes_written) => return Ok(bytes_written),
                Err(e) => e,
            };

            match err {
                TransferError::AtomicRenameUnsupported(reason) if mode == WriteMode::Staged => {
                    warn!(
                        "[{}] Degraded mode: remote cannot rename ({}), rewriting {} directly",
                        invocation.event_id, reason, destination
                    );
                    mode = WriteMode::Direct;
                    invocation.degraded = true;
                    // The fallback does not consume the retry budget
                    attempt -= 1;
                }
                err => {
                    let delay = next_delay(
                        "transfer",
                        &err,
                        attempt,
                        &self.config.retry,
                        invocation.deadline,
                    )
                    .ok_or(err)?;

                    within_deadline(invocation.deadline, Stage::Transferring.as_str(), async {
                        self.sleeper.sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
            }
        }
    }

    async fn fetch(
        &self,
        event: &TransferEvent,
        invocation: &mut Invocation,
    ) -> Result<FetchedObject, TransferError> {
        let deadline = invocation.deadline;
        let object = within_deadline(
            deadline,
            Stage::Fetching.as_str(),
            retry_with_backoff(
                "fetch",
                &self.config.retry,
                self.sleeper.as_ref(),
                deadline,
                &mut invocation.attempts,
                || self.fetcher.fetch(&event.store_name, &event.object_key),
            ),
        )
        .await?;

        debug!(
            "[{}] Fetched {} ({} bytes)",
            invocation.event_id, event.object_key, object.size
        );
        Ok(object)
    }

    async fn resolve_credential(
        &self,
        invocation: &mut Invocation,
    ) -> Result<Credential, TransferError> {
        let deadline = invocation.deadline;
        within_deadline(
            deadline,
            Stage::Authenticating.as_str(),
            retry_with_backoff(
                "resolve credentials",
                &self.config.retry,
                self.sleeper.as_ref(),
                deadline,
                &mut invocation.attempts,
                || self.credentials.resolve(&self.config.secret_id),
            ),
        )
        .await
    }

    async fn open_session(
        &self,
        credential: &Credential,
        invocation: &mut Invocation,
    ) -> Result<Box<dyn RemoteSession>, TransferError> {
        let deadline = invocation.deadline;
        within_deadline(
            deadline,
            Stage::Authenticating.as_str(),
            retry_with_backoff(
                "open session",
                &self.config.retry,
                self.sleeper.as_ref(),
                deadline,
                &mut invocation.attempts,
                || self.transport.open(credential),
            ),
        )
        .await
    }

    /// Stage and commit one attempt. The caller closes the session.
    async fn deliver(
        &self,
        session: &mut dyn RemoteSession,
        destination: &str,
        object: &mut FetchedObject,
        mode: WriteMode,
        invocation: &mut Invocation,
    ) -> Result<u64, TransferError> {
        let deadline = invocation.deadline;
        let expected = object.size;

        let staged = match tokio::time::timeout_at(
            deadline,
            session.stage(destination, &mut object.body, expected, mode),
        )
        .await
        {
            Ok(staged) => staged?,
            Err(_) => {
                warn!(
                    "[{}] Deadline hit while writing {}, aborting",
                    invocation.event_id, destination
                );
                return Err(TransferError::DeadlineExceeded(
                    Stage::Transferring.as_str().to_string(),
                ));
            }
        };

        if staged.bytes_written != expected {
            self.discard(session, &staged, invocation).await;
            return Err(TransferError::interrupted(format!(
                "wrote {} of {} bytes to {}",
                staged.bytes_written, expected, destination
            )));
        }

        invocation.enter(Stage::Finalizing);

        match tokio::time::timeout_at(deadline, session.commit(&staged)).await {
            Ok(Ok(())) => Ok(staged.bytes_written),
            Ok(Err(e @ TransferError::AtomicRenameUnsupported(_))) => Err(e),
            Ok(Err(e)) => {
                self.discard(session, &staged, invocation).await;
                Err(e)
            }
            Err(_) => Err(TransferError::DeadlineExceeded(
                Stage::Finalizing.as_str().to_string(),
            )),
        }
    }

    /// Remove a staged temp file, but never eat into the cleanup margin
    async fn discard(
        &self,
        session: &mut dyn RemoteSession,
        staged: &StagedFile,
        invocation: &Invocation,
    ) {
        if Instant::now() >= invocation.deadline {
            warn!(
                "[{}] Out of time, leaving {:?} behind",
                invocation.event_id, staged.temp_path
            );
            return;
        }

        if tokio::time::timeout_at(invocation.deadline, session.discard(staged))
            .await
            .is_err()
        {
            warn!(
                "[{}] Timed out removing {:?}",
                invocation.event_id, staged.temp_path
            );
        }
    }

    /// Close on every exit path, bounded by the invocation cutoff
    async fn close_session(&self, session: &mut dyn RemoteSession, invocation: &Invocation) {
        let event_id = &invocation.event_id;
        match tokio::time::timeout_at(invocation.cutoff, session.close()).await {
            Ok(Ok(())) => debug!("[{}] Session closed", event_id),
            Ok(Err(e)) => warn!("[{}] Session close failed: {}", event_id, e),
            Err(_) => warn!("[{}] Session close did not finish before the cutoff", event_id),
        }
    }
}
