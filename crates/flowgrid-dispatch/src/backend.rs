//! Dispatch backends.
//!
//! An execution runs either on the shared executors (`Poll`) or in its own
//! container (`Container`). Each backend only carries the operations that
//! make sense for it; [`ExecutionRouter`] picks the backend per execution.

use std::sync::Arc;

use tracing::{info, warn};

use flowgrid_rollout::DispatchCriteria;
use flowgrid_state::{DispatchMethod, Execution, ExecutionId, StateStore, Status};

use crate::error::{DispatchError, DispatchResult};
use crate::events::EventBus;
use crate::gateway::FlowContainerGateway;
use crate::lifecycle::finish_execution;
use crate::version_set::VersionRegistry;

/// Stamp the project's latest version and insert with the backend's start status.
fn insert_submission(
    store: &StateStore,
    events: &EventBus,
    registry: &dyn VersionRegistry,
    mut execution: Execution,
    method: DispatchMethod,
    start_status: Status,
) -> DispatchResult<Execution> {
    if let Some(version) = registry.latest_project_version(execution.project_id)? {
        execution.project_version = version;
    }
    execution.dispatch_method = method;
    execution.status = start_status;
    let execution = store.insert_execution(execution)?;
    events.publish(execution.id, Status::Ready, start_status);
    info!(
        execution_id = execution.id,
        flow = %execution.flow_name(),
        method = ?method,
        "execution submitted"
    );
    Ok(execution)
}

fn load_unfinished(store: &StateStore, id: ExecutionId) -> DispatchResult<Execution> {
    let execution = store
        .get_execution(id)?
        .ok_or(DispatchError::ExecutionNotFound(id))?;
    if execution.status.is_finished() {
        return Err(DispatchError::NotRunning {
            id,
            status: execution.status,
        });
    }
    Ok(execution)
}

// ── Poll ───────────────────────────────────────────────────────────

/// Shared executors pick PREPARING rows up themselves.
#[derive(Clone)]
pub struct PollBackend {
    store: StateStore,
    events: EventBus,
    registry: Arc<dyn VersionRegistry>,
}

impl PollBackend {
    pub fn new(store: StateStore, events: EventBus, registry: Arc<dyn VersionRegistry>) -> Self {
        Self {
            store,
            events,
            registry,
        }
    }

    pub fn submit(&self, execution: Execution) -> DispatchResult<Execution> {
        insert_submission(
            &self.store,
            &self.events,
            self.registry.as_ref(),
            execution,
            DispatchMethod::Poll,
            Status::Preparing,
        )
    }

    /// Flag the row KILLING; the executor running it stops the flow.
    pub fn cancel(&self, id: ExecutionId, user: &str) -> DispatchResult<Execution> {
        let current = load_unfinished(&self.store, id)?;
        if current.status == Status::Killing {
            return Ok(current);
        }
        let from = current.status;
        let killing = self
            .store
            .transition_execution(id, from, |e| e.status = Status::Killing)?
            .ok_or(DispatchError::Conflict(id))?;
        self.events.publish(id, from, Status::Killing);
        info!(execution_id = id, %user, "poll execution flagged for kill");
        Ok(killing)
    }
}

// ── Container ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ContainerBackend {
    store: StateStore,
    events: EventBus,
    registry: Arc<dyn VersionRegistry>,
    gateway: Arc<dyn FlowContainerGateway>,
}

impl ContainerBackend {
    pub fn new(
        store: StateStore,
        events: EventBus,
        registry: Arc<dyn VersionRegistry>,
        gateway: Arc<dyn FlowContainerGateway>,
    ) -> Self {
        Self {
            store,
            events,
            registry,
            gateway,
        }
    }

    pub fn submit(&self, execution: Execution) -> DispatchResult<Execution> {
        insert_submission(
            &self.store,
            &self.events,
            self.registry.as_ref(),
            execution,
            DispatchMethod::Containerized,
            Status::Ready,
        )
    }

    /// Cancel a containerized execution.
    ///
    /// Executions without a container yet are killed in place. Otherwise the
    /// container is asked to cancel; if it cannot be reached the execution
    /// is failed directly.
    pub async fn cancel(&self, id: ExecutionId, user: &str) -> DispatchResult<Execution> {
        let current = load_unfinished(&self.store, id)?;
        if matches!(current.status, Status::Ready | Status::Dispatching) {
            let reason = format!("cancelled by {user} before a container was created");
            return finish_execution(&self.store, &self.events, id, Status::Killed, Some(&reason));
        }

        match self.gateway.cancel(&current, user).await {
            Ok(()) => {
                info!(execution_id = id, %user, "cancel sent to flow container");
                Ok(current)
            }
            Err(e) => {
                warn!(execution_id = id, error = %e, "flow container unreachable, failing execution");
                let reason = format!("cancel by {user} could not reach the flow container: {e}");
                finish_execution(&self.store, &self.events, id, Status::Failed, Some(&reason))
            }
        }
    }
}

// ── Tagged variant ─────────────────────────────────────────────────

#[derive(Clone)]
pub enum DispatchBackend {
    Poll(PollBackend),
    Container(ContainerBackend),
}

impl DispatchBackend {
    pub fn method(&self) -> DispatchMethod {
        match self {
            DispatchBackend::Poll(_) => DispatchMethod::Poll,
            DispatchBackend::Container(_) => DispatchMethod::Containerized,
        }
    }

    pub fn start_status(&self) -> Status {
        match self {
            DispatchBackend::Poll(_) => Status::Preparing,
            DispatchBackend::Container(_) => Status::Ready,
        }
    }

    pub fn submit(&self, execution: Execution) -> DispatchResult<Execution> {
        match self {
            DispatchBackend::Poll(backend) => backend.submit(execution),
            DispatchBackend::Container(backend) => backend.submit(execution),
        }
    }

    pub async fn cancel(&self, id: ExecutionId, user: &str) -> DispatchResult<Execution> {
        match self {
            DispatchBackend::Poll(backend) => backend.cancel(id, user),
            DispatchBackend::Container(backend) => backend.cancel(id, user).await,
        }
    }
}

/// Routes submissions through the criteria chain and cancels to the
/// backend that owns the execution.
pub struct ExecutionRouter {
    store: StateStore,
    criteria: Arc<DispatchCriteria>,
    poll: DispatchBackend,
    container: DispatchBackend,
}

impl ExecutionRouter {
    pub fn new(
        store: StateStore,
        criteria: Arc<DispatchCriteria>,
        poll: PollBackend,
        container: ContainerBackend,
    ) -> Self {
        Self {
            store,
            criteria,
            poll: DispatchBackend::Poll(poll),
            container: DispatchBackend::Container(container),
        }
    }

    pub fn backend(&self, method: DispatchMethod) -> &DispatchBackend {
        match method {
            DispatchMethod::Poll => &self.poll,
            DispatchMethod::Containerized => &self.container,
        }
    }

    /// Submit a new execution. An execution already marked POLL keeps
    /// that decision; anything else goes through the criteria chain.
    pub fn submit(&self, execution: Execution) -> DispatchResult<Execution> {
        let method = match execution.dispatch_method {
            DispatchMethod::Poll => DispatchMethod::Poll,
            DispatchMethod::Containerized => self.criteria.dispatch_method(&execution),
        };
        self.backend(method).submit(execution)
    }

    pub async fn cancel(&self, id: ExecutionId, user: &str) -> DispatchResult<Execution> {
        let execution = self
            .store
            .get_execution(id)?
            .ok_or(DispatchError::ExecutionNotFound(id))?;
        self.backend(execution.dispatch_method).cancel(id, user).await
    }

    /// Cancel without surfacing errors; used by sweeps.
    pub async fn cancel_quietly(&self, id: ExecutionId, user: &str) -> Option<Execution> {
        match self.cancel(id, user).await {
            Ok(execution) => Some(execution),
            Err(e) => {
                warn!(execution_id = id, error = %e, "cancel failed");
                None
            }
        }
    }
}
