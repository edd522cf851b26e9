use thiserror::Error;

use switchyard_core::SwitchyardError;

use crate::work::WorkId;

/// Errors surfaced synchronously by the dispatch layer.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("scheduler is not running")]
    NotRunning,

    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("no handler matches routing key '{0}'")]
    NoHandler(String),

    #[error("handler '{0}' is already registered")]
    DuplicateHandler(String),

    #[error("unknown work item {0}")]
    UnknownWork(WorkId),

    #[error("housekeeping process '{name}' failed: {reason}")]
    Process { name: String, reason: String },

    #[error("scheduler internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Core(#[from] SwitchyardError),
}

/// Failure returned by a work item's execution delegate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkError {
    #[error("execution failed: {0}")]
    Failed(String),

    #[error("execution observed cancellation")]
    Cancelled,

    #[error("execution panicked: {0}")]
    Panicked(String),
}

impl WorkError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}
