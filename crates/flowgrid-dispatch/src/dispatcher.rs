//! ExecutionDispatcher — turns one claimed execution into a flow container.
//!
//! A dispatch resolves the version set, sizes the container, builds the pod
//! request, and asks the orchestrator to create it. On success the row moves
//! DISPATCHING → PREPARING with the version set recorded. On failure the
//! row is moved out of DISPATCHING according to the [`FailurePolicy`]:
//! requeued to READY, or failed and restarted. Errors that would recur on
//! every retry (version resolution, pod template) always fail the execution,
//! and an execution that exhausts its requeue budget is failed too. A pod or
//! service that already exists under the execution's name is adopted.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use flowgrid_core::config::FailurePolicy;
use flowgrid_core::{ContainerOrchestrator, OrchestratorError};
use flowgrid_metrics::DispatchMetrics;
use flowgrid_state::{Execution, ExecutionId, StateStore, Status};

use crate::error::{DispatchError, DispatchResult};
use crate::events::EventBus;
use crate::lifecycle::{finalize_execution, restart_execution};
use crate::pod::PodRequestBuilder;
use crate::resources::{ResourceRecommender, ResourceSizer};
use crate::version_set::VersionSetResolver;

/// Outcome of a single dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Container created; execution is PREPARING.
    Dispatched { pod: String },
    /// The execution was not in DISPATCHING when the worker got to it.
    Skipped,
    /// The execution left DISPATCHING while its container was being created.
    Superseded,
    Requeued,
    Finalized { restarted_as: Option<ExecutionId> },
}

pub struct ExecutionDispatcher {
    store: StateStore,
    resolver: VersionSetResolver,
    sizer: ResourceSizer,
    pods: PodRequestBuilder,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    recommender: Option<Arc<dyn ResourceRecommender>>,
    events: EventBus,
    metrics: Arc<DispatchMetrics>,
    failure_policy: FailurePolicy,
    max_restart_attempts: u32,
    max_requeue_attempts: u32,
}

impl ExecutionDispatcher {
    pub fn new(
        store: StateStore,
        resolver: VersionSetResolver,
        sizer: ResourceSizer,
        pods: PodRequestBuilder,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        events: EventBus,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            store,
            resolver,
            sizer,
            pods,
            orchestrator,
            recommender: None,
            events,
            metrics,
            failure_policy: FailurePolicy::default(),
            max_restart_attempts: 2,
            max_requeue_attempts: 5,
        }
    }

    pub fn with_recommender(mut self, recommender: Arc<dyn ResourceRecommender>) -> Self {
        self.recommender = Some(recommender);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy, max_restart_attempts: u32) -> Self {
        self.failure_policy = policy;
        self.max_restart_attempts = max_restart_attempts;
        self
    }

    pub fn with_requeue_limit(mut self, max_requeue_attempts: u32) -> Self {
        self.max_requeue_attempts = max_requeue_attempts;
        self
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Dispatch one execution. Never fails: every outcome is recorded on
    /// the execution row, in metrics, and in the log.
    pub async fn dispatch(&self, id: ExecutionId) -> DispatchOutcome {
        let started = Instant::now();
        match self.try_dispatch(id).await {
            Ok(DispatchOutcome::Dispatched { pod }) => {
                let elapsed = started.elapsed();
                self.metrics.record_dispatch_success(elapsed);
                info!(
                    execution_id = id,
                    %pod,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "execution dispatched"
                );
                DispatchOutcome::Dispatched { pod }
            }
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.record_dispatch_failure();
                error!(
                    execution_id = id,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "dispatch failed"
                );
                self.handle_failure(id, &e)
            }
        }
    }

    async fn try_dispatch(&self, id: ExecutionId) -> DispatchResult<DispatchOutcome> {
        let execution = self
            .store
            .get_execution(id)?
            .ok_or(DispatchError::ExecutionNotFound(id))?;
        if execution.status != Status::Dispatching {
            debug!(execution_id = id, status = %execution.status, "not dispatching, skipped");
            return Ok(DispatchOutcome::Skipped);
        }

        let required = self.resolver.required_image_types(&execution);
        let version_set = self.resolver.resolve(&execution, &required)?;

        let recommendation = match &self.recommender {
            Some(recommender) => recommender.recommend(&execution).await,
            None => None,
        };
        let sizing = self.sizer.size(&execution, recommendation.as_ref());
        let request = self.pods.build(&execution, &version_set, &sizing)?;

        match self.orchestrator.create_pod(&request.pod).await {
            Ok(()) => {}
            Err(OrchestratorError::AlreadyExists(pod)) => {
                info!(execution_id = id, %pod, "pod already exists, adopting it");
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(service) = &request.service {
            match self.orchestrator.create_service(service).await {
                Ok(()) => {}
                Err(OrchestratorError::AlreadyExists(name)) => {
                    info!(execution_id = id, service = %name, "service already exists, adopting it");
                }
                Err(e) => {
                    self.remove_pod(id, &request.pod.name).await;
                    return Err(e.into());
                }
            }
        }

        let version_set_id = version_set.id;
        let moved = self
            .store
            .transition_execution(id, Status::Dispatching, |e| {
                e.status = Status::Preparing;
                e.version_set_id = Some(version_set_id);
            })?;
        if moved.is_none() {
            warn!(execution_id = id, "execution left DISPATCHING during dispatch, removing container");
            self.remove_pod(id, &request.pod.name).await;
            if let Some(service) = &request.service {
                if let Err(e) = self.orchestrator.delete_service(&service.name).await {
                    warn!(execution_id = id, error = %e, "failed to delete service");
                }
            }
            return Ok(DispatchOutcome::Superseded);
        }
        self.events.publish(id, Status::Dispatching, Status::Preparing);
        Ok(DispatchOutcome::Dispatched {
            pod: request.pod.name,
        })
    }

    async fn remove_pod(&self, id: ExecutionId, pod: &str) {
        if let Err(e) = self.orchestrator.delete_pod(pod).await {
            warn!(execution_id = id, %pod, error = %e, "failed to delete pod");
        }
    }

    fn handle_failure(&self, id: ExecutionId, cause: &DispatchError) -> DispatchOutcome {
        let result = if cause.is_fatal() || self.failure_policy == FailurePolicy::FinalizeAndRestart {
            self.finalize(id, &format!("dispatch failed: {cause}"), !cause.is_fatal())
        } else {
            self.requeue(id, cause)
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(execution_id = id, error = %e, "failed to record dispatch failure");
                DispatchOutcome::Skipped
            }
        }
    }

    fn requeue(&self, id: ExecutionId, cause: &DispatchError) -> DispatchResult<DispatchOutcome> {
        let attempts = self
            .store
            .get_execution(id)?
            .ok_or(DispatchError::ExecutionNotFound(id))?
            .dispatch_attempts;
        if attempts >= self.max_requeue_attempts {
            warn!(execution_id = id, attempts, "requeue limit reached, failing execution");
            let reason = format!("dispatch failed {} times, last error: {cause}", attempts + 1);
            return self.finalize(id, &reason, false);
        }

        let requeued = self.store.transition_execution(id, Status::Dispatching, |e| {
            e.status = Status::Ready;
            e.dispatch_attempts += 1;
        })?;
        if requeued.is_none() {
            return Ok(DispatchOutcome::Skipped);
        }
        self.events.publish(id, Status::Dispatching, Status::Ready);
        self.metrics.record_requeued();
        info!(execution_id = id, attempt = attempts + 1, "execution requeued");
        Ok(DispatchOutcome::Requeued)
    }

    /// Fail the execution; `retryable` allows a restart under the
    /// finalize-and-restart policy.
    fn finalize(&self, id: ExecutionId, reason: &str, retryable: bool) -> DispatchResult<DispatchOutcome> {
        let execution: Execution = finalize_execution(&self.store, &self.events, id, reason)?;
        if execution.status != Status::Failed {
            return Ok(DispatchOutcome::Skipped);
        }
        self.metrics.record_finalized();

        let restartable = self.failure_policy == FailurePolicy::FinalizeAndRestart
            && retryable
            && execution.attempt < self.max_restart_attempts;
        if !restartable {
            return Ok(DispatchOutcome::Finalized { restarted_as: None });
        }
        let next = restart_execution(&self.store, &self.events, &execution, Status::Ready)?;
        self.metrics.record_restarted();
        Ok(DispatchOutcome::Finalized {
            restarted_as: Some(next.id),
        })
    }
}
