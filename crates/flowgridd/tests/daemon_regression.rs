//! End-to-end checks of the assembled daemon: REST API in front of the
//! router, queue processor, and dispatcher, with in-memory orchestrator
//! and gateway standing in for the cluster.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use flowgrid_api::{build_router, ApiState};
use flowgrid_core::config::{KubernetesConfig, QueueConfig, ResourcesConfig, RolloutConfig};
use flowgrid_dispatch::testing::{MockGateway, MockOrchestrator};
use flowgrid_dispatch::{
    ContainerBackend, DispatchAdmin, EventBus, ExecutionDispatcher, ExecutionRouter,
    PodRequestBuilder, PollBackend, QueueProcessor, ResourceSizer, StoreRegistry,
    VersionSetResolver,
};
use flowgrid_metrics::DispatchMetrics;
use flowgrid_rollout::DispatchCriteria;
use flowgrid_state::{ImageState, ImageVersion, StateStore, Status};

struct Daemon {
    store: StateStore,
    orchestrator: Arc<MockOrchestrator>,
    gateway: Arc<MockGateway>,
    queue: Arc<QueueProcessor>,
    router: axum::Router,
}

fn register(store: &StateStore, image_type: &str, version: &str) {
    store
        .put_image_version(&ImageVersion {
            image_type: image_type.to_string(),
            version: version.to_string(),
            state: ImageState::Active,
            created_at: 1,
        })
        .unwrap();
}

fn daemon() -> Daemon {
    let store = StateStore::open_in_memory().unwrap();
    register(&store, "azkaban-base", "1.0");
    register(&store, "azkaban-config", "0.3");
    register(&store, "java", "2.0");

    let events = EventBus::default();
    let metrics = Arc::new(DispatchMetrics::new());
    let registry = Arc::new(StoreRegistry::new(store.clone()));
    let orchestrator = Arc::new(MockOrchestrator::new());
    let gateway = Arc::new(MockGateway::new());
    let k8s = KubernetesConfig::default();

    let mut rollout = RolloutConfig::default();
    rollout.ramp_up_percent = 100;
    let criteria = Arc::new(DispatchCriteria::from_config(&rollout).unwrap());

    let dispatcher = ExecutionDispatcher::new(
        store.clone(),
        VersionSetResolver::new(store.clone(), registry.clone(), &k8s),
        ResourceSizer::from_config(&ResourcesConfig::default()),
        PodRequestBuilder::new(k8s),
        orchestrator.clone(),
        events.clone(),
        metrics.clone(),
    );
    let queue_config = QueueConfig {
        poll_interval_ms: 20,
        ..QueueConfig::default()
    };
    let queue = Arc::new(QueueProcessor::new(
        store.clone(),
        Arc::new(dispatcher),
        events.clone(),
        metrics.clone(),
        queue_config,
    ));
    let exec_router = Arc::new(ExecutionRouter::new(
        store.clone(),
        criteria.clone(),
        PollBackend::new(store.clone(), events.clone(), registry.clone()),
        ContainerBackend::new(store.clone(), events, registry, gateway.clone()),
    ));

    let router = build_router(ApiState {
        store: store.clone(),
        router: exec_router,
        admin: DispatchAdmin::new(queue.clone(), criteria),
        metrics,
    });

    Daemon {
        store,
        orchestrator,
        gateway,
        queue,
        router,
    }
}

async fn send(router: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn submission(flow: &str) -> Value {
    json!({
        "project_id": 1,
        "project_name": "proj",
        "flow_id": flow,
        "submit_user": "alice",
        "nodes": [{"kind": "job", "id": "a", "job_type": "java"}]
    })
}

async fn wait_for_status(store: &StateStore, id: u64, status: Status) {
    for _ in 0..200 {
        if store.get_execution(id).unwrap().unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {id} never reached {status}");
}

#[tokio::test]
async fn submitted_execution_is_dispatched_to_a_container() {
    let d = daemon();
    assert!(d.queue.start().await);

    let (status, body) = send(&d.router, "POST", "/api/v1/executions", Some(submission("etl"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "READY");
    assert_eq!(body["data"]["dispatch_method"], "CONTAINERIZED");
    let id = body["data"]["id"].as_u64().unwrap();

    wait_for_status(&d.store, id, Status::Preparing).await;
    let pods = d.orchestrator.created_pods();
    assert_eq!(pods.len(), 1);
    assert!(pods[0].name.ends_with(&id.to_string()));

    let (status, body) = send(&d.router, "GET", &format!("/api/v1/executions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "PREPARING");
    assert!(body["data"]["version_set_id"].is_u64());

    d.queue.shutdown().await;
}

#[tokio::test]
async fn disabled_dispatch_holds_work_until_enabled() {
    let d = daemon();
    let (status, body) = send(&d.router, "POST", "/api/v1/dispatch/disable", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], false);
    assert!(d.queue.start().await);

    let (_, body) = send(&d.router, "POST", "/api/v1/executions", Some(submission("held"))).await;
    let id = body["data"]["id"].as_u64().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(d.store.get_execution(id).unwrap().unwrap().status, Status::Ready);
    assert!(d.orchestrator.created_pods().is_empty());

    let (_, body) = send(&d.router, "POST", "/api/v1/dispatch/enable", None).await;
    assert_eq!(body["data"]["enabled"], true);
    wait_for_status(&d.store, id, Status::Preparing).await;

    d.queue.shutdown().await;
}

#[tokio::test]
async fn cancel_reaches_the_flow_container() {
    let d = daemon();
    assert!(d.queue.start().await);

    let (_, body) = send(&d.router, "POST", "/api/v1/executions", Some(submission("etl"))).await;
    let id = body["data"]["id"].as_u64().unwrap();
    wait_for_status(&d.store, id, Status::Preparing).await;

    let (status, _) = send(
        &d.router,
        "POST",
        &format!("/api/v1/executions/{id}/cancel"),
        Some(json!({"user": "bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(d.gateway.cancels(), vec![id]);

    d.queue.shutdown().await;
}

#[tokio::test]
async fn cancel_before_dispatch_kills_and_logs() {
    let d = daemon();
    let (_, body) = send(&d.router, "POST", "/api/v1/executions", Some(submission("etl"))).await;
    let id = body["data"]["id"].as_u64().unwrap();

    let (status, body) = send(
        &d.router,
        "POST",
        &format!("/api/v1/executions/{id}/cancel"),
        Some(json!({"user": "bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "KILLED");
    assert!(d.gateway.cancels().is_empty());

    let (status, _) = send(
        &d.router,
        "POST",
        &format!("/api/v1/executions/{id}/cancel"),
        Some(json!({"user": "bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn metrics_reflect_dispatches() {
    let d = daemon();
    assert!(d.queue.start().await);
    let (_, body) = send(&d.router, "POST", "/api/v1/executions", Some(submission("etl"))).await;
    let id = body["data"]["id"].as_u64().unwrap();
    wait_for_status(&d.store, id, Status::Preparing).await;
    d.queue.shutdown().await;

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = d.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = String::from_utf8(resp.into_body().collect().await.unwrap().to_bytes().to_vec()).unwrap();
    assert!(text.contains("flowgrid_executions_claimed_total 1"));
    assert!(text.contains("flowgrid_dispatch_success_total 1"));
    assert!(text.contains("flowgrid_executions{status=\"PREPARING\"} 1"));
}
