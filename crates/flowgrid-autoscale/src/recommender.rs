//! VpaRecommender — per-flow autoscaler lookup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use flowgrid_core::config::{KubernetesConfig, VpaConfig};
use flowgrid_core::{epoch_millis, AutoscalerSpec, ContainerOrchestrator, OrchestratorError, Quantity};
use flowgrid_dispatch::pod::{FLOW_POD_APP_LABEL, LABEL_APP, LABEL_CLUSTER, LABEL_FLOW};
use flowgrid_dispatch::{flow_label_value, ResourceRecommendation, ResourceRecommender};
use flowgrid_state::Execution;

use crate::error::{AutoscaleError, AutoscaleResult};

const UPDATE_MODE_OFF: &str = "Off";

/// Autoscaler object name for a flow.
pub fn autoscaler_name(prefix: &str, execution: &Execution) -> String {
    let name = format!("{prefix}-{}", flow_label_value(execution));
    let truncated: String = name.chars().take(63).collect();
    truncated.trim_end_matches('-').to_string()
}

fn validated(name: &'static str, value: &str) -> AutoscaleResult<String> {
    Quantity::parse(value).map_err(|source| AutoscaleError::InvalidBound { name, source })?;
    Ok(value.to_string())
}

fn bounds(cpu: String, memory: String) -> BTreeMap<String, String> {
    BTreeMap::from([("cpu".to_string(), cpu), ("memory".to_string(), memory)])
}

pub struct VpaRecommender {
    orchestrator: Arc<dyn ContainerOrchestrator>,
    namespace: String,
    cluster: String,
    container_name: String,
    name_prefix: String,
    min_age: Duration,
    fetch_timeout: Duration,
    cpu_multiplier: f64,
    memory_multiplier: f64,
    min_allowed: BTreeMap<String, String>,
    max_allowed: BTreeMap<String, String>,
}

impl VpaRecommender {
    /// Fails if any configured bound is not a valid quantity.
    pub fn new(
        orchestrator: Arc<dyn ContainerOrchestrator>,
        vpa: &VpaConfig,
        kubernetes: &KubernetesConfig,
    ) -> AutoscaleResult<Self> {
        let min_allowed = bounds(
            validated("min_allowed_cpu", &vpa.min_allowed_cpu)?,
            validated("min_allowed_memory", &vpa.min_allowed_memory)?,
        );
        let max_allowed = bounds(
            validated("max_allowed_cpu", &vpa.max_allowed_cpu)?,
            validated("max_allowed_memory", &vpa.max_allowed_memory)?,
        );
        Ok(Self {
            orchestrator,
            namespace: kubernetes.namespace.clone(),
            cluster: kubernetes.cluster_name.clone(),
            container_name: kubernetes.flow_container_name.clone(),
            name_prefix: vpa.name_prefix.clone(),
            min_age: Duration::from_secs(vpa.min_age_before_recommendation_secs),
            fetch_timeout: Duration::from_secs(vpa.fetch_timeout_secs),
            cpu_multiplier: vpa.cpu_recommendation_multiplier,
            memory_multiplier: vpa.memory_recommendation_multiplier,
            min_allowed,
            max_allowed,
        })
    }

    fn spec_for(&self, name: String, execution: &Execution) -> AutoscalerSpec {
        AutoscalerSpec {
            name,
            namespace: self.namespace.clone(),
            container_name: self.container_name.clone(),
            target_labels: BTreeMap::from([
                (LABEL_APP.to_string(), FLOW_POD_APP_LABEL.to_string()),
                (LABEL_CLUSTER.to_string(), self.cluster.clone()),
                (LABEL_FLOW.to_string(), flow_label_value(execution)),
            ]),
            min_allowed: self.min_allowed.clone(),
            max_allowed: self.max_allowed.clone(),
            update_mode: UPDATE_MODE_OFF.to_string(),
        }
    }

    /// Scale raw cores and bytes, rounding down to whole millicores and
    /// whole kibibytes. Both carry a unit suffix so the sizer compares them
    /// against its configured maximums.
    fn scaled(&self, cpu: f64, memory: f64) -> Option<ResourceRecommendation> {
        let millicores = (cpu * self.cpu_multiplier * 1000.0).trunc();
        let kibibytes = (memory * self.memory_multiplier / 1024.0).trunc();
        if !(millicores >= 1.0 && kibibytes >= 1.0) {
            return None;
        }
        Some(ResourceRecommendation {
            cpu: format!("{}m", millicores as u64),
            memory: format!("{}Ki", kibibytes as u64),
        })
    }

    pub(crate) async fn recommend_at(
        &self,
        execution: &Execution,
        now: u64,
    ) -> AutoscaleResult<Option<ResourceRecommendation>> {
        let name = autoscaler_name(&self.name_prefix, execution);
        let lookup = tokio::time::timeout(self.fetch_timeout, self.orchestrator.get_autoscaler(&name))
            .await
            .map_err(|_| AutoscaleError::Timeout(self.fetch_timeout.as_secs()))??;

        let Some(object) = lookup else {
            match self.orchestrator.create_autoscaler(&self.spec_for(name.clone(), execution)).await {
                Ok(()) => info!(autoscaler = %name, "autoscaler created"),
                Err(OrchestratorError::AlreadyExists(_)) => {
                    debug!(autoscaler = %name, "autoscaler created concurrently")
                }
                Err(e) => return Err(e.into()),
            }
            return Ok(None);
        };

        let age = Duration::from_millis(now.saturating_sub(object.created_at));
        if age < self.min_age {
            debug!(autoscaler = %name, age_secs = age.as_secs(), "autoscaler too young");
            return Ok(None);
        }

        let Some(raw) = object
            .recommendations
            .iter()
            .find(|r| r.container_name == self.container_name)
        else {
            debug!(autoscaler = %name, "no recommendation published yet");
            return Ok(None);
        };
        Ok(self.scaled(raw.cpu, raw.memory))
    }
}

#[async_trait]
impl ResourceRecommender for VpaRecommender {
    async fn recommend(&self, execution: &Execution) -> Option<ResourceRecommendation> {
        match self.recommend_at(execution, epoch_millis()).await {
            Ok(recommendation) => {
                if let Some(r) = &recommendation {
                    debug!(execution_id = execution.id, cpu = %r.cpu, memory = %r.memory, "using autoscaler recommendation");
                }
                recommendation
            }
            Err(e) => {
                warn!(execution_id = execution.id, error = %e, "autoscaler recommendation unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrid_core::config::ResourcesConfig;
    use flowgrid_core::{AutoscalerObject, ContainerRecommendation};
    use flowgrid_dispatch::ResourceSizer;
    use flowgrid_dispatch::testing::MockOrchestrator;

    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

    fn recommender(orchestrator: Arc<MockOrchestrator>, vpa: VpaConfig) -> VpaRecommender {
        VpaRecommender::new(orchestrator, &vpa, &KubernetesConfig::default()).unwrap()
    }

    fn execution() -> Execution {
        Execution::new(1, "proj", "daily", "alice")
    }

    fn object(created_at: u64, container: &str, cpu: f64, memory: f64) -> AutoscalerObject {
        AutoscalerObject {
            name: "fc-vpa-proj-daily".to_string(),
            created_at,
            recommendations: vec![ContainerRecommendation {
                container_name: container.to_string(),
                cpu,
                memory,
            }],
        }
    }

    #[test]
    fn name_is_derived_from_flow() {
        assert_eq!(autoscaler_name("fc-vpa", &execution()), "fc-vpa-proj-daily");
        let long = Execution::new(1, "p", &"f".repeat(80), "alice");
        assert!(autoscaler_name("fc-vpa", &long).len() <= 63);
    }

    #[test]
    fn invalid_bound_is_rejected() {
        let vpa = VpaConfig {
            max_allowed_memory: "lots".to_string(),
            ..VpaConfig::default()
        };
        let err = VpaRecommender::new(Arc::new(MockOrchestrator::new()), &vpa, &KubernetesConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("max_allowed_memory"));
    }

    #[tokio::test]
    async fn missing_object_is_created_and_none_returned() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        let rec = recommender(orchestrator.clone(), VpaConfig::default());
        assert_eq!(rec.recommend(&execution()).await, None);

        let created = orchestrator.created_autoscalers();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "fc-vpa-proj-daily");
        assert_eq!(created[0].update_mode, "Off");
        assert_eq!(created[0].min_allowed["memory"], "1Gi");
        assert_eq!(created[0].max_allowed["cpu"], "8");
        assert_eq!(created[0].target_labels[LABEL_FLOW], "proj-daily");
        assert_eq!(created[0].container_name, "az-flow-container");
    }

    #[tokio::test]
    async fn young_object_gives_none() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.insert_autoscaler(object(1_000_000, "az-flow-container", 2.0, 4.0 * GIB));
        let rec = recommender(orchestrator, VpaConfig::default());
        // 10 minutes old, 20 required.
        let now = 1_000_000 + 600_000;
        assert_eq!(rec.recommend_at(&execution(), now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_container_recommendation_gives_none() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.insert_autoscaler(object(0, "sidecar", 2.0, 4.0 * GIB));
        let rec = recommender(orchestrator, VpaConfig::default());
        assert_eq!(rec.recommend_at(&execution(), 10_000_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn recommendation_is_scaled_and_rounded() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.insert_autoscaler(object(0, "az-flow-container", 0.3337, 1_000_000.7));
        let vpa = VpaConfig {
            cpu_recommendation_multiplier: 1.5,
            memory_recommendation_multiplier: 2.0,
            ..VpaConfig::default()
        };
        let rec = recommender(orchestrator.clone(), vpa);
        let result = rec.recommend_at(&execution(), 10_000_000).await.unwrap().unwrap();
        assert_eq!(result.cpu, "500m");
        // 2_000_001.4 bytes
        assert_eq!(result.memory, "1953Ki");
        assert!(orchestrator.created_autoscalers().is_empty());
    }

    #[tokio::test]
    async fn recommendation_drives_container_sizing() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.insert_autoscaler(object(0, "az-flow-container", 2.0, 4.0 * GIB));
        let rec = recommender(orchestrator, VpaConfig::default());
        let exec = execution();
        let recommendation = rec.recommend_at(&exec, 10_000_000).await.unwrap().unwrap();
        assert_eq!(recommendation.memory, "4194304Ki");

        let sizing = ResourceSizer::from_config(&ResourcesConfig::default())
            .size(&exec, Some(&recommendation));
        assert_eq!(sizing.cpu_request, "2000m");
        assert_eq!(sizing.memory_request, "4194304Ki");
        assert_ne!(sizing.memory_request, ResourcesConfig::default().memory_request);
    }

    #[tokio::test]
    async fn sub_kibibyte_memory_is_ignored() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.insert_autoscaler(object(0, "az-flow-container", 1.0, 1000.0));
        let rec = recommender(orchestrator, VpaConfig::default());
        assert_eq!(rec.recommend_at(&execution(), 10_000_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_recommendation_is_ignored() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.insert_autoscaler(object(0, "az-flow-container", 0.0, 0.0));
        let rec = recommender(orchestrator, VpaConfig::default());
        assert_eq!(rec.recommend_at(&execution(), 10_000_000).await.unwrap(), None);
    }
}
