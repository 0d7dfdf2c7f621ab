//! Dispatch error types.

use thiserror::Error;

use flowgrid_core::OrchestratorError;
use flowgrid_rollout::RolloutError;
use flowgrid_state::{ExecutionId, Status};

/// Errors that can occur while dispatching or controlling an execution.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("execution {id} is not running (status {status})")]
    NotRunning { id: ExecutionId, status: Status },

    #[error("no version available for image type: {image_type}")]
    MissingVersion { image_type: String },

    #[error("image type {image_type} has no registered version {version} in an allowed state")]
    UnregisteredOverride { image_type: String, version: String },

    #[error("execution {0} changed concurrently, giving up")]
    Conflict(ExecutionId),

    #[error("version set not found: {0}")]
    VersionSetNotFound(String),

    #[error("pod template error: {0}")]
    Template(String),

    #[error("invalid admin action: {0}")]
    InvalidAction(String),

    #[error("flow container unreachable: {0}")]
    Gateway(String),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("state store error: {0}")]
    State(#[from] flowgrid_state::StateError),

    #[error("rollout error: {0}")]
    Rollout(RolloutError),
}

impl From<RolloutError> for DispatchError {
    fn from(e: RolloutError) -> Self {
        match e {
            RolloutError::MissingVersion { image_type } => DispatchError::MissingVersion { image_type },
            RolloutError::State(e) => DispatchError::State(e),
            other => DispatchError::Rollout(other),
        }
    }
}

impl DispatchError {
    /// Errors that will recur on every retry of the same execution.
    pub fn is_fatal(&self) -> bool {
        match self {
            DispatchError::MissingVersion { .. }
            | DispatchError::UnregisteredOverride { .. }
            | DispatchError::VersionSetNotFound(_)
            | DispatchError::Template(_) => true,
            DispatchError::State(e) => !e.is_storage(),
            _ => false,
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrid_state::StateError;

    #[test]
    fn bad_rows_are_fatal_but_storage_failures_are_not() {
        let corrupt = DispatchError::State(StateError::Corrupt {
            record: "execution",
            reason: "expected value".to_string(),
        });
        assert!(corrupt.is_fatal());
        assert!(DispatchError::State(StateError::ExecutionNotFound(7)).is_fatal());

        let storage = DispatchError::State(StateError::Storage {
            op: "claim_batch",
            reason: "io".to_string(),
        });
        assert!(!storage.is_fatal());
        assert!(!DispatchError::Gateway("timeout".to_string()).is_fatal());
    }
}
