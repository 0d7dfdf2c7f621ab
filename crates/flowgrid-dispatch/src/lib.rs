//! flowgrid-dispatch — the containerized dispatch engine.
//!
//! Takes executions from READY to a running flow container:
//!
//! - `backend` routes submissions and cancels to the shared executors
//!   (`Poll`) or to per-execution containers (`Container`).
//! - `queue` claims READY executions in batches and feeds a bounded
//!   worker pool, paced by a token-bucket `rate_limiter`.
//! - `dispatcher` resolves the version set, sizes resources, builds the
//!   pod request, and creates the pod (and service) for one execution.
//! - `lifecycle` finalizes and restarts executions with compare-and-set
//!   transitions; every transition is published on the `events` bus.
//! - `admin` toggles dispatch and edits the live criteria.
//! - `remote` holds the production orchestrator and container gateway.

pub mod admin;
pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gateway;
pub mod lifecycle;
pub mod pod;
pub mod queue;
pub mod rate_limiter;
pub mod remote;
pub mod resources;
pub mod version_set;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use admin::{AdminAction, DispatchAdmin, DispatchStatus, PropertyUpdate};
pub use backend::{ContainerBackend, DispatchBackend, ExecutionRouter, PollBackend};
pub use dispatcher::{DispatchOutcome, ExecutionDispatcher};
pub use error::{DispatchError, DispatchResult};
pub use events::{EventBus, ExecutionEvent};
pub use gateway::FlowContainerGateway;
pub use remote::{HttpGateway, HttpOrchestrator};
pub use lifecycle::{finalize_execution, finish_execution, restart_execution};
pub use pod::{flow_label_value, PodRequest, PodRequestBuilder};
pub use queue::QueueProcessor;
pub use rate_limiter::RateLimiter;
pub use resources::{ResourceRecommendation, ResourceRecommender, ResourceSizer, Sizing};
pub use version_set::{StoreRegistry, VersionRegistry, VersionSetResolver};
