//! Transfer Retry Logic
//!
//! Bounded exponential backoff. The handler is the only caller; components
//! never retry on their own.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::TransferError;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per step, first try included
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_backoff: Duration,

    /// Backoff multiplier for each retry
    pub backoff_multiplier: f64,

    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Set custom backoff parameters
    pub fn with_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.backoff_multiplier = multiplier;
        self.max_backoff = max;
        self
    }
}

/// Calculate backoff delay before retry number `retry` (0-based)
pub fn calculate_backoff(retry: u32, config: &RetryConfig) -> Duration {
    let delay_ms = (config.initial_backoff.as_millis() as f64
        * config.backoff_multiplier.powi(retry as i32))
    .min(config.max_backoff.as_millis() as f64);

    Duration::from_millis(delay_ms.max(0.0).round() as u64)
}

/// Waits out a backoff delay. Tests inject one that returns immediately.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Real timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Bound a step by the invocation deadline
pub async fn within_deadline<T, Fut>(
    deadline: Instant,
    step: &str,
    fut: Fut,
) -> Result<T, TransferError>
where
    Fut: Future<Output = Result<T, TransferError>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::DeadlineExceeded(step.to_string())),
    }
}

/// Decide whether a failed attempt gets another try.
///
/// Returns the delay to wait, or `None` when the error is final: it is not
/// retryable, the attempt budget is spent, or the backoff would overrun the
/// deadline.
pub fn next_delay(
    step: &str,
    error: &TransferError,
    attempt: u32,
    config: &RetryConfig,
    deadline: Instant,
) -> Option<Duration> {
    if !error.is_retryable() {
        warn!("{} failed with non-retryable error: {}", step, error);
        return None;
    }

    if attempt >= config.max_attempts {
        warn!("{} failed after {} attempts: {}", step, attempt, error);
        return None;
    }

    let delay = calculate_backoff(attempt - 1, config);
    if Instant::now() + delay >= deadline {
        warn!(
            "{} failed and backoff of {:?} would overrun the deadline: {}",
            step, delay, error
        );
        return None;
    }

    info!(
        "{} attempt {}/{} failed, retrying in {:?}: {}",
        step, attempt, config.max_attempts, delay, error
    );
    Some(delay)
}

/// Run `op` until it succeeds or [`next_delay`] gives up.
///
/// `attempts` accumulates every try made, for reporting.
pub async fn retry_with_backoff<T, F, Fut>(
    step: &str,
    config: &RetryConfig,
    sleeper: &dyn Sleeper,
    deadline: Instant,
    attempts: &mut u32,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        *attempts += 1;

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match next_delay(step, &e, attempt, config, deadline) {
                Some(delay) => sleeper.sleep(delay).await,
                None => return Err(e),
            },
        }
    }
}
