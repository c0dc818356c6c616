use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::item::{ItemId, Metadata};

/// Terminal status of a single work item.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Success,
    FetchFailure,
    /// The processing stage raised a recoverable exception. Partial results
    /// may still have been emitted.
    ProcessException,
    /// The execution context died without reporting.
    ProcessCrash,
    EmitFailure,
    Timeout,
    /// The job was cancelled before this item could finish.
    Cancelled,
}

impl OutcomeStatus {
    pub const ALL: [OutcomeStatus; 7] = [
        OutcomeStatus::Success,
        OutcomeStatus::FetchFailure,
        OutcomeStatus::ProcessException,
        OutcomeStatus::ProcessCrash,
        OutcomeStatus::EmitFailure,
        OutcomeStatus::Timeout,
        OutcomeStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::FetchFailure => "fetch_failure",
            OutcomeStatus::ProcessException => "process_exception",
            OutcomeStatus::ProcessCrash => "process_crash",
            OutcomeStatus::EmitFailure => "emit_failure",
            OutcomeStatus::Timeout => "timeout",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, OutcomeStatus::Success)
    }
}

impl Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of processing one work item. Exactly one is produced per item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub item_id: ItemId,
    pub status: OutcomeStatus,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result_metadata: Vec<Metadata>,
}

impl Outcome {
    pub fn success(item_id: ItemId, result_metadata: Vec<Metadata>) -> Self {
        Self {
            item_id,
            status: OutcomeStatus::Success,
            elapsed_ms: 0,
            error_message: None,
            result_metadata,
        }
    }

    pub fn failure(
        item_id: ItemId,
        status: OutcomeStatus,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            item_id,
            status,
            elapsed_ms: 0,
            error_message: Some(error_message.into()),
            result_metadata: Vec::new(),
        }
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn with_result_metadata(mut self, result_metadata: Vec<Metadata>) -> Self {
        self.result_metadata = result_metadata;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}
