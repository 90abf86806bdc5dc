//! Transfer orchestration
//!
//! The handler state machine, its retry policy and the result it reports.

pub mod handler;
pub mod retry;
pub mod types;

pub use handler::TransferHandler;
pub use retry::{RetryConfig, Sleeper, TokioSleeper};
pub use types::{Outcome, Stage, TransferResult};
