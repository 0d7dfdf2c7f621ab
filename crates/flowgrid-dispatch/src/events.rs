//! Execution status notifications.
//!
//! Fire-and-forget: publishing never blocks and never fails the caller,
//! whether or not anybody is listening.

use tokio::sync::broadcast;
use tracing::trace;

use flowgrid_core::epoch_millis;
use flowgrid_state::{ExecutionId, Status};

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionEvent {
    pub execution_id: ExecutionId,
    pub from: Status,
    pub to: Status,
    pub at: u64,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, execution_id: ExecutionId, from: Status, to: Status) {
        let event = ExecutionEvent {
            execution_id,
            from,
            to,
            at: epoch_millis(),
        };
        if self.tx.send(event).is_err() {
            trace!(execution_id, %from, %to, "status event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
