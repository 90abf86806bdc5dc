//! Transfer data types

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, ErrorKind, TransferError};

/// Handler state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Fetching,
    Authenticating,
    Transferring,
    Finalizing,
    Succeeded,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Fetching => "fetching",
            Stage::Authenticating => "authenticating",
            Stage::Transferring => "transferring",
            Stage::Finalizing => "finalizing",
            Stage::Succeeded => "succeeded",
            Stage::Failed => "failed",
        }
    }
}

/// Terminal outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
}

/// The single result an invocation reports to its caller
///
/// Carries no credential material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub event_id: Option<String>,
    pub store_name: Option<String>,
    /// Empty when the event could not be parsed
    pub object_key: String,
    pub destination: Option<String>,
    pub bytes_written: u64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Stage that was active when the invocation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    /// Every attempt made across all steps
    pub attempts: u32,
    /// The remote was written without a temp-file rename
    pub degraded: bool,
    pub elapsed_ms: u64,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub(crate) fn record_failure(&mut self, error: &TransferError, stage: Stage) {
        let kind = error.kind();
        self.outcome = Outcome::Failed;
        self.bytes_written = 0;
        self.error_kind = Some(kind);
        self.error_category = Some(kind.category());
        self.error_detail = Some(error.to_string());
        self.failed_stage = Some(stage);
    }
}
