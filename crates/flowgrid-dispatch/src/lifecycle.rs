//! Terminal transitions and restarts.

use tracing::{info, warn};

use flowgrid_core::epoch_millis;
use flowgrid_state::{Execution, ExecutionId, StateStore, Status};

use crate::error::{DispatchError, DispatchResult};
use crate::events::EventBus;

/// Move an execution to a finished status.
///
/// An execution that already finished is returned unchanged. The reason,
/// when given, is stored on the row and appended to the execution log;
/// a log write failure does not undo the transition.
pub fn finish_execution(
    store: &StateStore,
    events: &EventBus,
    id: ExecutionId,
    status: Status,
    reason: Option<&str>,
) -> DispatchResult<Execution> {
    // Retry if another writer moves the row between read and write.
    for _ in 0..3 {
        let current = store
            .get_execution(id)?
            .ok_or(DispatchError::ExecutionNotFound(id))?;
        if current.status.is_finished() {
            return Ok(current);
        }

        let from = current.status;
        let now = epoch_millis();
        let finished = store.transition_execution(id, from, |execution| {
            execution.status = status;
            execution.end_time = Some(now);
            if let Some(reason) = reason {
                execution.error = Some(reason.to_string());
            }
        })?;
        let Some(finished) = finished else {
            continue;
        };

        if let Some(reason) = reason {
            if let Err(e) = store.append_execution_log(id, reason) {
                warn!(execution_id = id, error = %e, "failed to append finalize reason to execution log");
            }
        }
        events.publish(id, from, status);
        info!(execution_id = id, %from, to = %status, "execution finished");
        return Ok(finished);
    }
    Err(DispatchError::Conflict(id))
}

/// Mark an execution FAILED with a reason.
pub fn finalize_execution(
    store: &StateStore,
    events: &EventBus,
    id: ExecutionId,
    reason: &str,
) -> DispatchResult<Execution> {
    finish_execution(store, events, id, Status::Failed, Some(reason))
}

/// Submit a fresh attempt of the same flow.
pub fn restart_execution(
    store: &StateStore,
    events: &EventBus,
    previous: &Execution,
    start_status: Status,
) -> DispatchResult<Execution> {
    let mut next = Execution::new(
        previous.project_id,
        &previous.project_name,
        &previous.flow_id,
        &previous.submit_user,
    );
    next.project_version = previous.project_version;
    next.dispatch_method = previous.dispatch_method;
    next.flow_params = previous.flow_params.clone();
    next.proxy_user = previous.proxy_user.clone();
    next.proxy_users = previous.proxy_users.clone();
    next.nodes = previous.nodes.clone();
    next.restart_of = Some(previous.id);
    next.attempt = previous.attempt + 1;
    next.status = start_status;

    let next = store.insert_execution(next)?;
    events.publish(next.id, Status::Ready, start_status);
    info!(
        execution_id = next.id,
        restart_of = previous.id,
        attempt = next.attempt,
        "execution restarted"
    );
    Ok(next)
}
