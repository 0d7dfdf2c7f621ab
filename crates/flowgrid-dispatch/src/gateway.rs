//! Control channel to a running flow container.

use async_trait::async_trait;

use flowgrid_state::Execution;

use crate::error::DispatchResult;

/// Reaches the flow container that runs an execution.
#[async_trait]
pub trait FlowContainerGateway: Send + Sync {
    /// Ask the container to cancel its flow on behalf of `user`.
    async fn cancel(&self, execution: &Execution, user: &str) -> DispatchResult<()>;
}
