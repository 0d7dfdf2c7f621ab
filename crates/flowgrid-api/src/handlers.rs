//! REST API handlers.
//!
//! Each handler goes through the router, the admin handle, or the store and
//! returns JSON in the `ApiResponse` envelope.

use std::collections::{BTreeMap, BTreeSet};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::warn;

use flowgrid_dispatch::{AdminAction, DispatchError, PropertyUpdate};
use flowgrid_state::{Execution, ExecutionId, FlowNode, Status};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn dispatch_error(e: &DispatchError) -> axum::response::Response {
    let status = match e {
        DispatchError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::NotRunning { .. } | DispatchError::Conflict(_) => StatusCode::CONFLICT,
        DispatchError::InvalidAction(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Dispatch admin ─────────────────────────────────────────────

/// GET /api/v1/dispatch
pub async fn dispatch_status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.admin.status())
}

fn apply(state: &ApiState, action: AdminAction) -> axum::response::Response {
    match state.admin.apply(action) {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => dispatch_error(&e),
    }
}

/// POST /api/v1/dispatch/enable
pub async fn enable_dispatch(State(state): State<ApiState>) -> impl IntoResponse {
    apply(&state, AdminAction::EnableDispatch)
}

/// POST /api/v1/dispatch/disable
pub async fn disable_dispatch(State(state): State<ApiState>) -> impl IntoResponse {
    apply(&state, AdminAction::DisableDispatch)
}

/// POST /api/v1/dispatch/property
pub async fn update_property(
    State(state): State<ApiState>,
    Json(update): Json<PropertyUpdate>,
) -> impl IntoResponse {
    apply(&state, AdminAction::UpdateProperty(update))
}

// ── Executions ─────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// GET /api/v1/executions
pub async fn list_executions(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let result = match query.status.as_deref() {
        Some(raw) => match raw.parse::<Status>() {
            Ok(status) => state.store.list_by_status(status),
            Err(e) => return error_response(&e, StatusCode::BAD_REQUEST).into_response(),
        },
        None => state.store.list_executions(),
    };
    match result {
        Ok(executions) => ApiResponse::ok(executions).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// Submit request body.
#[derive(serde::Deserialize)]
pub struct SubmitRequest {
    pub project_id: u32,
    pub project_name: String,
    pub flow_id: String,
    pub submit_user: String,
    #[serde(default)]
    pub project_version: u32,
    #[serde(default)]
    pub proxy_user: Option<String>,
    #[serde(default)]
    pub proxy_users: BTreeSet<String>,
    #[serde(default)]
    pub flow_params: BTreeMap<String, String>,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
}

impl SubmitRequest {
    fn into_execution(self) -> Execution {
        let mut execution =
            Execution::new(self.project_id, &self.project_name, &self.flow_id, &self.submit_user)
                .with_nodes(self.nodes);
        execution.project_version = self.project_version;
        execution.proxy_user = self.proxy_user;
        execution.proxy_users = self.proxy_users;
        execution.flow_params = self.flow_params;
        execution
    }
}

/// POST /api/v1/executions
pub async fn submit_execution(
    State(state): State<ApiState>,
    Json(req): Json<SubmitRequest>,
) -> impl IntoResponse {
    match state.router.submit(req.into_execution()) {
        Ok(execution) => (StatusCode::CREATED, ApiResponse::ok(execution)).into_response(),
        Err(e) => dispatch_error(&e),
    }
}

/// GET /api/v1/executions/{id}
pub async fn get_execution(
    State(state): State<ApiState>,
    Path(id): Path<ExecutionId>,
) -> impl IntoResponse {
    match state.store.get_execution(id) {
        Ok(Some(execution)) => ApiResponse::ok(execution).into_response(),
        Ok(None) => error_response("execution not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/executions/{id}/logs
pub async fn execution_logs(
    State(state): State<ApiState>,
    Path(id): Path<ExecutionId>,
) -> impl IntoResponse {
    match state.store.list_execution_logs(id) {
        Ok(lines) => ApiResponse::ok(lines).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// Cancel request body.
#[derive(serde::Deserialize)]
pub struct CancelRequest {
    pub user: String,
}

/// POST /api/v1/executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<ApiState>,
    Path(id): Path<ExecutionId>,
    Json(req): Json<CancelRequest>,
) -> impl IntoResponse {
    match state.router.cancel(id, &req.user).await {
        Ok(execution) => ApiResponse::ok(execution).into_response(),
        Err(e) => {
            warn!(execution_id = id, error = %e, "cancel rejected");
            dispatch_error(&e)
        }
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let mut counts: BTreeMap<Status, u64> = BTreeMap::new();
    for execution in state.store.list_executions().unwrap_or_default() {
        *counts.entry(execution.status).or_default() += 1;
    }
    let gauges: Vec<(String, u64)> = counts
        .into_iter()
        .map(|(status, count)| (status.to_string(), count))
        .collect();

    let body = flowgrid_metrics::render_prometheus(
        &state.metrics.snapshot(),
        &gauges,
        state.admin.status().enabled,
    );
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
