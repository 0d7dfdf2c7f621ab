//! In-memory collaborators for tests in this and downstream crates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use flowgrid_core::{
    epoch_millis, AutoscalerObject, AutoscalerSpec, ContainerOrchestrator, OrchestratorError,
    OrchestratorResult, PodInfo, PodSpec, ServiceSpec,
};
use flowgrid_state::{Execution, ExecutionId};

use crate::error::{DispatchError, DispatchResult};
use crate::gateway::FlowContainerGateway;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records every call; pod and service creation can be made to fail.
#[derive(Default)]
pub struct MockOrchestrator {
    fail_pods: AtomicBool,
    fail_services: AtomicBool,
    pods: Mutex<BTreeMap<String, PodInfo>>,
    created: Mutex<Vec<PodSpec>>,
    deleted: Mutex<Vec<String>>,
    services: Mutex<Vec<String>>,
    deleted_services: Mutex<Vec<String>>,
    autoscalers: Mutex<BTreeMap<String, AutoscalerObject>>,
    created_autoscalers: Mutex<Vec<AutoscalerSpec>>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_pod_creation(&self, fail: bool) {
        self.fail_pods.store(fail, Ordering::SeqCst);
    }

    pub fn fail_service_creation(&self, fail: bool) {
        self.fail_services.store(fail, Ordering::SeqCst);
    }

    /// Pretend a pod already exists.
    pub fn insert_pod(&self, pod: PodInfo) {
        lock(&self.pods).insert(pod.name.clone(), pod);
    }

    pub fn insert_autoscaler(&self, autoscaler: AutoscalerObject) {
        lock(&self.autoscalers).insert(autoscaler.name.clone(), autoscaler);
    }

    pub fn created_pods(&self) -> Vec<PodSpec> {
        lock(&self.created).clone()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    pub fn live_pods(&self) -> Vec<String> {
        lock(&self.pods).keys().cloned().collect()
    }

    pub fn created_services(&self) -> Vec<String> {
        lock(&self.services).clone()
    }

    pub fn deleted_services(&self) -> Vec<String> {
        lock(&self.deleted_services).clone()
    }

    pub fn created_autoscalers(&self) -> Vec<AutoscalerSpec> {
        lock(&self.created_autoscalers).clone()
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ContainerOrchestrator for MockOrchestrator {
    async fn create_pod(&self, spec: &PodSpec) -> OrchestratorResult<()> {
        if self.fail_pods.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Request("injected pod failure".to_string()));
        }
        let mut pods = lock(&self.pods);
        if pods.contains_key(&spec.name) {
            return Err(OrchestratorError::AlreadyExists(spec.name.clone()));
        }
        pods.insert(
            spec.name.clone(),
            PodInfo {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                created_at: epoch_millis(),
            },
        );
        lock(&self.created).push(spec.clone());
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> OrchestratorResult<()> {
        lock(&self.pods).remove(name);
        lock(&self.deleted).push(name.to_string());
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<()> {
        if self.fail_services.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Request("injected service failure".to_string()));
        }
        lock(&self.services).push(spec.name.clone());
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> OrchestratorResult<()> {
        lock(&self.deleted_services).push(name.to_string());
        Ok(())
    }

    async fn list_pods(&self, label_selector: &str) -> OrchestratorResult<Vec<PodInfo>> {
        Ok(lock(&self.pods)
            .values()
            .filter(|pod| matches_selector(&pod.labels, label_selector))
            .cloned()
            .collect())
    }

    async fn get_autoscaler(&self, name: &str) -> OrchestratorResult<Option<AutoscalerObject>> {
        Ok(lock(&self.autoscalers).get(name).cloned())
    }

    async fn create_autoscaler(&self, spec: &AutoscalerSpec) -> OrchestratorResult<()> {
        let mut autoscalers = lock(&self.autoscalers);
        if autoscalers.contains_key(&spec.name) {
            return Err(OrchestratorError::AlreadyExists(spec.name.clone()));
        }
        autoscalers.insert(
            spec.name.clone(),
            AutoscalerObject {
                name: spec.name.clone(),
                created_at: epoch_millis(),
                recommendations: Vec::new(),
            },
        );
        lock(&self.created_autoscalers).push(spec.clone());
        Ok(())
    }
}

/// Records cancel calls; can be made unreachable.
#[derive(Default)]
pub struct MockGateway {
    unreachable: AtomicBool,
    cancels: Mutex<Vec<ExecutionId>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn cancels(&self) -> Vec<ExecutionId> {
        lock(&self.cancels).clone()
    }
}

#[async_trait]
impl FlowContainerGateway for MockGateway {
    async fn cancel(&self, execution: &Execution, _user: &str) -> DispatchResult<()> {
        lock(&self.cancels).push(execution.id);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DispatchError::Gateway("connection refused".to_string()));
        }
        Ok(())
    }
}
