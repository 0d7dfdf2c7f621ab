//! flowgrid-api — REST API for the dispatch engine.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/dispatch` | Dispatch toggle and live criteria |
//! | POST | `/api/v1/dispatch/enable` | Resume claiming |
//! | POST | `/api/v1/dispatch/disable` | Stop claiming |
//! | POST | `/api/v1/dispatch/property` | Edit a criteria input |
//! | GET | `/api/v1/executions?status=` | List executions |
//! | POST | `/api/v1/executions` | Submit an execution |
//! | GET | `/api/v1/executions/{id}` | Get one execution |
//! | GET | `/api/v1/executions/{id}/logs` | Execution log lines |
//! | POST | `/api/v1/executions/{id}/cancel` | Cancel an execution |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use flowgrid_dispatch::{DispatchAdmin, ExecutionRouter};
use flowgrid_metrics::DispatchMetrics;
use flowgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub router: Arc<ExecutionRouter>,
    pub admin: DispatchAdmin,
    pub metrics: Arc<DispatchMetrics>,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/dispatch", get(handlers::dispatch_status))
        .route("/dispatch/enable", post(handlers::enable_dispatch))
        .route("/dispatch/disable", post(handlers::disable_dispatch))
        .route("/dispatch/property", post(handlers::update_property))
        .route("/executions", get(handlers::list_executions).post(handlers::submit_execution))
        .route("/executions/{id}", get(handlers::get_execution))
        .route("/executions/{id}/logs", get(handlers::execution_logs))
        .route("/executions/{id}/cancel", post(handlers::cancel_execution))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
