//! Aged container sweep.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use flowgrid_core::config::{CleanupConfig, KubernetesConfig};
use flowgrid_core::{epoch_millis, ContainerOrchestrator};
use flowgrid_dispatch::pod::{
    service_name, FLOW_POD_APP_LABEL, LABEL_APP, LABEL_CLUSTER, LABEL_EXECUTION_ID,
};
use flowgrid_metrics::DispatchMetrics;
use flowgrid_state::ExecutionId;

/// Deletes this cluster's flow containers once they pass the maximum age.
pub struct ContainerSweeper {
    orchestrator: Arc<dyn ContainerOrchestrator>,
    kubernetes: KubernetesConfig,
    max_age: Duration,
    interval: Duration,
    metrics: Arc<DispatchMetrics>,
}

impl ContainerSweeper {
    pub fn new(
        orchestrator: Arc<dyn ContainerOrchestrator>,
        kubernetes: KubernetesConfig,
        config: &CleanupConfig,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            orchestrator,
            kubernetes,
            max_age: Duration::from_secs(config.container_max_age_hours * 3600),
            interval: Duration::from_secs(config.container_sweep_interval_secs.max(1)),
            metrics,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn selector(&self) -> String {
        format!(
            "{LABEL_APP}={FLOW_POD_APP_LABEL},{LABEL_CLUSTER}={}",
            self.kubernetes.cluster_name
        )
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(epoch_millis()).await
    }

    /// Returns the number of pods deleted.
    pub async fn sweep_at(&self, now: u64) -> usize {
        let pods = match self.orchestrator.list_pods(&self.selector()).await {
            Ok(pods) => pods,
            Err(e) => {
                error!(error = %e, "failed to list flow containers");
                self.metrics.record_reaper_error();
                return 0;
            }
        };

        let cutoff = now.saturating_sub(self.max_age.as_millis() as u64);
        let mut deleted = 0;
        for pod in pods.iter().filter(|pod| pod.created_at < cutoff) {
            if let Err(e) = self.orchestrator.delete_pod(&pod.name).await {
                warn!(pod = %pod.name, error = %e, "failed to delete aged container");
                self.metrics.record_reaper_error();
                continue;
            }
            deleted += 1;
            self.metrics.record_stale_container_deleted();
            debug!(pod = %pod.name, "aged container deleted");

            if self.kubernetes.service_required {
                let id = pod
                    .labels
                    .get(LABEL_EXECUTION_ID)
                    .and_then(|v| v.parse::<ExecutionId>().ok());
                if let Some(id) = id {
                    if let Err(e) = self
                        .orchestrator
                        .delete_service(&service_name(&self.kubernetes, id))
                        .await
                    {
                        warn!(execution_id = id, error = %e, "failed to delete service");
                    }
                }
            }
        }
        if deleted > 0 {
            info!(deleted, max_age_hours = self.max_age.as_secs() / 3600, "aged containers removed");
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use flowgrid_core::PodInfo;
    use flowgrid_dispatch::testing::MockOrchestrator;

    const HOUR: u64 = 3_600_000;

    fn pod(name: &str, cluster: &str, id: &str, created_at: u64) -> PodInfo {
        PodInfo {
            name: name.to_string(),
            labels: BTreeMap::from([
                (LABEL_APP.to_string(), FLOW_POD_APP_LABEL.to_string()),
                (LABEL_CLUSTER.to_string(), cluster.to_string()),
                (LABEL_EXECUTION_ID.to_string(), id.to_string()),
            ]),
            created_at,
        }
    }

    #[tokio::test]
    async fn deletes_only_aged_pods_of_this_cluster() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        let now = 100 * HOUR;
        orchestrator.insert_pod(pod("old", "flowgrid", "1", now - 30 * HOUR));
        orchestrator.insert_pod(pod("young", "flowgrid", "2", now - HOUR));
        orchestrator.insert_pod(pod("foreign", "other", "3", now - 30 * HOUR));

        let kubernetes = KubernetesConfig {
            service_required: true,
            ..KubernetesConfig::default()
        };
        let metrics = Arc::new(DispatchMetrics::new());
        let sweeper = ContainerSweeper::new(
            orchestrator.clone(),
            kubernetes,
            &CleanupConfig::default(),
            metrics.clone(),
        );

        assert_eq!(sweeper.sweep_at(now).await, 1);
        assert_eq!(orchestrator.deleted_pods(), vec!["old".to_string()]);
        assert_eq!(orchestrator.deleted_services(), vec!["fc-svc-flowgrid-1".to_string()]);
        assert_eq!(metrics.snapshot().stale_containers_deleted, 1);

        let mut live = orchestrator.live_pods();
        live.sort();
        assert_eq!(live, vec!["foreign".to_string(), "young".to_string()]);
    }
}
