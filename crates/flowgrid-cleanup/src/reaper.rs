//! StaleExecutionReaper — cancels executions stuck in an in-flight status.
//!
//! For every in-flight status in a fixed order, executions older than the
//! status threshold are cancelled through the router, and their container
//! is deleted. Deletion is idempotent and always requested. Executions reaped
//! before they reached RUNNING are resubmitted, within the restart budget.
//! A line is appended to each execution's log. Each execution is handled on
//! its own: a failure is logged and counted, and the sweep moves on.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use flowgrid_core::config::{CleanupConfig, KubernetesConfig};
use flowgrid_core::{epoch_millis, ContainerOrchestrator};
use flowgrid_dispatch::pod::{pod_name, service_name, PARAM_DEV_POD};
use flowgrid_dispatch::{restart_execution, EventBus, ExecutionRouter};
use flowgrid_metrics::DispatchMetrics;
use flowgrid_state::{Execution, StateStore, Status};

/// Statuses swept, in sweep order.
pub const REAPED_STATUSES: [Status; 7] = [
    Status::Dispatching,
    Status::Preparing,
    Status::Running,
    Status::Paused,
    Status::Killing,
    Status::ExecutionStopped,
    Status::FailedFinishing,
];

const REAPER_USER: &str = "flowgrid-reaper";

/// Extra time granted to long-running statuses on top of the flow limit.
const RUNNING_SLACK_MINS: i64 = 60;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cancelled: u32,
    pub deleted: u32,
    pub restarted: u32,
    pub skipped: u32,
    pub errors: u32,
}

fn minutes(mins: i64) -> Option<Duration> {
    u64::try_from(mins).ok().map(|m| Duration::from_secs(m * 60))
}

/// Where reaped executions are resubmitted, and how often a flow may be.
struct RestartPolicy {
    events: EventBus,
    max_attempts: u32,
}

pub struct StaleExecutionReaper {
    store: StateStore,
    router: Arc<ExecutionRouter>,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    kubernetes: KubernetesConfig,
    config: CleanupConfig,
    metrics: Arc<DispatchMetrics>,
    restarts: Option<RestartPolicy>,
}

impl StaleExecutionReaper {
    pub fn new(
        store: StateStore,
        router: Arc<ExecutionRouter>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        kubernetes: KubernetesConfig,
        config: CleanupConfig,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            store,
            router,
            orchestrator,
            kubernetes,
            config,
            metrics,
            restarts: None,
        }
    }

    /// Resubmit executions reaped before RUNNING, at most `max_attempts`
    /// times per flow run.
    pub fn with_restarts(mut self, events: EventBus, max_attempts: u32) -> Self {
        self.restarts = Some(RestartPolicy { events, max_attempts });
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.execution_sweep_interval_secs.max(1))
    }

    /// Maximum time allowed in `status`; `None` when the sweep is disabled for it.
    pub fn threshold(&self, status: Status) -> Option<Duration> {
        let c = &self.config;
        match status {
            Status::Dispatching => minutes(c.max_dispatching_mins),
            Status::Preparing => minutes(c.max_preparing_mins),
            Status::Running | Status::Paused | Status::FailedFinishing => {
                if c.max_running_mins < 0 {
                    None
                } else {
                    minutes(c.max_running_mins + RUNNING_SLACK_MINS)
                }
            }
            Status::Killing => minutes(c.max_killing_mins),
            Status::ExecutionStopped => minutes(c.max_stopped_mins),
            _ => None,
        }
    }

    /// Dev pods are kept in PREPARING for interactive debugging during the grace period.
    fn is_ignored(&self, status: Status, execution: &Execution, now: u64) -> bool {
        if status != Status::Preparing || !execution.param_flag(PARAM_DEV_POD) {
            return false;
        }
        let grace = Duration::from_secs(self.config.dev_pod_grace_hours * 3600).as_millis() as u64;
        now.saturating_sub(execution.submit_time) < grace
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(epoch_millis()).await
    }

    pub async fn sweep_at(&self, now: u64) -> SweepReport {
        let mut report = SweepReport::default();
        for status in REAPED_STATUSES {
            let Some(threshold) = self.threshold(status) else {
                continue;
            };
            let stale = match self.store.fetch_stale(status, threshold, now) {
                Ok(stale) => stale,
                Err(e) => {
                    error!(%status, error = %e, "failed to fetch stale executions");
                    self.metrics.record_reaper_error();
                    report.errors += 1;
                    continue;
                }
            };
            if !stale.is_empty() {
                info!(%status, count = stale.len(), "stale executions found");
            }
            for execution in stale {
                if self.is_ignored(status, &execution, now) {
                    debug!(execution_id = execution.id, %status, "dev pod within grace period, skipped");
                    self.metrics.record_reaper_skipped();
                    report.skipped += 1;
                    continue;
                }
                self.reap(status, &execution, &mut report).await;
            }
        }
        if report != SweepReport::default() {
            info!(
                cancelled = report.cancelled,
                deleted = report.deleted,
                restarted = report.restarted,
                skipped = report.skipped,
                errors = report.errors,
                "stale execution sweep finished"
            );
        }
        report
    }

    async fn reap(&self, status: Status, execution: &Execution, report: &mut SweepReport) {
        let id = execution.id;
        let mut notes = vec![format!("reaper: execution stuck in {status}")];

        let cancelled = match self.router.cancel_quietly(id, REAPER_USER).await {
            Some(after) => {
                self.metrics.record_reaper_cancelled();
                report.cancelled += 1;
                notes.push(format!("cancel requested, status now {}", after.status));
                Some(after)
            }
            None => {
                self.metrics.record_reaper_error();
                report.errors += 1;
                notes.push("cancel failed".to_string());
                None
            }
        };

        if let Some(after) = cancelled.filter(|after| after.status.is_finished()) {
            if let Some(note) = self.restart(status, &after, report) {
                notes.push(note);
            }
        }

        match self.delete_container(execution).await {
            Ok(()) => {
                self.metrics.record_reaper_deleted();
                report.deleted += 1;
                notes.push("container deleted".to_string());
            }
            Err(e) => {
                warn!(execution_id = id, error = %e, "failed to delete container");
                self.metrics.record_reaper_error();
                report.errors += 1;
                notes.push(format!("container delete failed: {e}"));
            }
        }

        if let Err(e) = self.store.append_execution_log(id, &notes.join("; ")) {
            warn!(execution_id = id, error = %e, "failed to record reaper log line");
        }
    }

    /// Resubmit a finished execution that never reached RUNNING.
    fn restart(&self, status: Status, finished: &Execution, report: &mut SweepReport) -> Option<String> {
        let policy = self.restarts.as_ref()?;
        if !matches!(status, Status::Dispatching | Status::Preparing) {
            return None;
        }
        if finished.attempt >= policy.max_attempts {
            info!(execution_id = finished.id, attempt = finished.attempt, "restart budget spent, not restarting");
            return Some("not restarted, restart budget spent".to_string());
        }
        match restart_execution(&self.store, &policy.events, finished, Status::Ready) {
            Ok(next) => {
                info!(execution_id = finished.id, restarted_as = next.id, "reaped execution restarted");
                self.metrics.record_restarted();
                report.restarted += 1;
                Some(format!("restarted as {}", next.id))
            }
            Err(e) => {
                error!(execution_id = finished.id, error = %e, "failed to restart reaped execution");
                self.metrics.record_reaper_error();
                report.errors += 1;
                Some(format!("restart failed: {e}"))
            }
        }
    }

    async fn delete_container(&self, execution: &Execution) -> flowgrid_core::OrchestratorResult<()> {
        self.orchestrator
            .delete_pod(&pod_name(&self.kubernetes, execution.id))
            .await?;
        if self.kubernetes.service_required {
            self.orchestrator
                .delete_service(&service_name(&self.kubernetes, execution.id))
                .await?;
        }
        Ok(())
    }
}
