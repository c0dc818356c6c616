use thiserror::Error;

use crate::item::JobId;

/// Job-level errors. Per-item failures are never surfaced through this type;
/// they become an [`Outcome`](crate::outcome::Outcome) for the item instead.
#[derive(Debug, Error)]
pub enum PipesError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("state store {op} failed for `{key}` after {attempts} attempt(s): {message}")]
    StateStore {
        op: &'static str,
        key: String,
        attempts: u32,
        message: String,
    },

    #[error("source error: {0}")]
    Source(String),

    #[error("worker protocol error: {0}")]
    Protocol(String),

    #[error("job {0} was cancelled")]
    Cancelled(JobId),

    #[error("internal error: {0}")]
    Internal(String),

    /// A child worker hit a job-level failure it could not turn into an
    /// item outcome.
    #[error("worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipesError {
    pub fn config(message: impl Into<String>) -> Self {
        PipesError::Config(message.into())
    }

    /// Whether this error aborts the job before any item is dispatched.
    pub fn is_setup_error(&self) -> bool {
        matches!(self, PipesError::Config(_) | PipesError::Source(_))
    }

    /// Whether the shared state store gave up. Such errors end the job
    /// rather than fail a single item.
    pub fn is_state_store(&self) -> bool {
        matches!(self, PipesError::StateStore { .. })
    }
}

pub type Result<T, E = PipesError> = std::result::Result<T, E>;
