use thiserror::Error;

use flowgrid_core::{OrchestratorError, QuantityError};

#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("invalid autoscaler bound {name}: {source}")]
    InvalidBound {
        name: &'static str,
        #[source]
        source: QuantityError,
    },

    #[error("autoscaler lookup timed out after {0}s")]
    Timeout(u64),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
