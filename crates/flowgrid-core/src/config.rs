//! flowgrid.toml configuration parser.
//!
//! Every section is optional and every field has a default, so an empty
//! file yields a working single-node configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowgridConfig {
    pub queue: QueueConfig,
    pub rollout: RolloutConfig,
    pub kubernetes: KubernetesConfig,
    pub resources: ResourcesConfig,
    pub cleanup: CleanupConfig,
    pub vpa: VpaConfig,
    pub api: ApiConfig,
    pub store: StoreConfig,
}

/// What to do with an execution whose container could not be created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Put the execution back to READY so a later poll cycle retries it.
    #[default]
    Requeue,
    /// Fail the execution and submit a fresh attempt of the same flow.
    FinalizeAndRestart,
}

/// How the ramp-up percentage is applied to a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampMode {
    /// Hash of the flow name; the same flow always gets the same answer.
    #[default]
    Deterministic,
    /// Uniform draw per evaluation.
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub worker_pool_size: usize,
    pub rate_limit_per_sec: f64,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub failure_policy: FailurePolicy,
    pub max_restart_attempts: u32,
    /// Requeues allowed per execution before it is failed instead.
    pub max_requeue_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            worker_pool_size: 10,
            rate_limit_per_sec: 20.0,
            poll_interval_ms: 1000,
            shutdown_timeout_secs: 30,
            failure_policy: FailurePolicy::Requeue,
            max_restart_attempts: 2,
            max_requeue_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub ramp_up_percent: u32,
    pub ramp_mode: RampMode,
    pub job_type_allow_list: Vec<String>,
    pub proxy_user_deny_list: Vec<String>,
    /// Project id → highest project version that must stay on the shared executors.
    pub project_version_deny_list: BTreeMap<String, u32>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            ramp_up_percent: 0,
            ramp_mode: RampMode::Deterministic,
            job_type_allow_list: vec!["ALL".to_string()],
            proxy_user_deny_list: Vec::new(),
            project_version_deny_list: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub namespace: String,
    pub cluster_name: String,
    pub api_server: String,
    pub pod_name_prefix: String,
    pub service_name_prefix: String,
    pub service_required: bool,
    pub service_port: u16,
    pub flow_container_name: String,
    pub base_image_type: String,
    pub config_image_type: String,
    /// Image types shipped alongside every flow container (e.g. shared libraries).
    pub dependency_types: Vec<String>,
    /// Job types already baked into the base image; no init container is needed.
    pub bundled_job_types: Vec<String>,
    pub init_mount_path_for_jobtypes: String,
    pub mount_path_for_jobtypes: String,
    pub init_mount_path_for_dependencies: String,
    pub mount_path_for_dependencies: String,
    pub image_registry: String,
    pub secret_name: Option<String>,
    pub secret_volume: String,
    pub secret_mount_path: String,
    pub pod_template_path: Option<PathBuf>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            cluster_name: "flowgrid".to_string(),
            api_server: "http://127.0.0.1:8001".to_string(),
            pod_name_prefix: "fc-dep".to_string(),
            service_name_prefix: "fc-svc".to_string(),
            service_required: false,
            service_port: 54343,
            flow_container_name: "az-flow-container".to_string(),
            base_image_type: "azkaban-base".to_string(),
            config_image_type: "azkaban-config".to_string(),
            dependency_types: Vec::new(),
            bundled_job_types: Vec::new(),
            init_mount_path_for_jobtypes: "/data/jobtypes".to_string(),
            mount_path_for_jobtypes:
                "/export/apps/azkaban/azkaban-exec-server/current/plugins/jobtypes".to_string(),
            init_mount_path_for_dependencies: "/data/dependencies".to_string(),
            mount_path_for_dependencies:
                "/export/apps/azkaban/azkaban-exec-server/current/dependencies".to_string(),
            image_registry: "docker.io/flowgrid".to_string(),
            secret_name: None,
            secret_volume: "azkaban-k8s-secret".to_string(),
            secret_mount_path: "/var/run/secrets".to_string(),
            pod_template_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub cpu_request: String,
    pub cpu_limit_multiplier: u32,
    pub max_allowed_cpu: String,
    pub memory_request: String,
    pub memory_limit_multiplier: u32,
    pub max_allowed_memory: String,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            cpu_request: "1".to_string(),
            cpu_limit_multiplier: 1,
            max_allowed_cpu: "8".to_string(),
            memory_request: "2Gi".to_string(),
            memory_limit_multiplier: 1,
            max_allowed_memory: "64Gi".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub execution_sweep_interval_secs: u64,
    pub container_sweep_interval_secs: u64,
    pub max_dispatching_mins: i64,
    pub max_preparing_mins: i64,
    /// Upper bound on flow run time; negative disables the running sweep.
    pub max_running_mins: i64,
    pub max_killing_mins: i64,
    pub max_stopped_mins: i64,
    pub dev_pod_grace_hours: u64,
    pub container_max_age_hours: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            execution_sweep_interval_secs: 600,
            container_sweep_interval_secs: 3600,
            max_dispatching_mins: 10,
            max_preparing_mins: 15,
            max_running_mins: -1,
            max_killing_mins: 15,
            max_stopped_mins: 15,
            dev_pod_grace_hours: 48,
            container_max_age_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VpaConfig {
    pub enabled: bool,
    pub name_prefix: String,
    pub min_age_before_recommendation_secs: u64,
    pub fetch_timeout_secs: u64,
    pub cpu_recommendation_multiplier: f64,
    pub memory_recommendation_multiplier: f64,
    pub min_allowed_cpu: String,
    pub max_allowed_cpu: String,
    pub min_allowed_memory: String,
    pub max_allowed_memory: String,
}

impl Default for VpaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name_prefix: "fc-vpa".to_string(),
            min_age_before_recommendation_secs: 1200,
            fetch_timeout_secs: 120,
            cpu_recommendation_multiplier: 1.0,
            memory_recommendation_multiplier: 1.0,
            min_allowed_cpu: "0.5".to_string(),
            max_allowed_cpu: "8".to_string(),
            min_allowed_memory: "1Gi".to_string(),
            max_allowed_memory: "64Gi".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("flowgrid.redb"),
        }
    }
}

impl FlowgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlowgridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Project-version deny entries keyed by numeric project id.
    ///
    /// Keys that are not integers are dropped.
    pub fn project_version_denials(&self) -> BTreeMap<u32, u32> {
        self.rollout
            .project_version_deny_list
            .iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|id| (id, *v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: FlowgridConfig = toml::from_str("").unwrap();
        assert!(config.queue.enabled);
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.worker_pool_size, 10);
        assert_eq!(config.queue.failure_policy, FailurePolicy::Requeue);
        assert_eq!(config.queue.max_requeue_attempts, 5);
        assert_eq!(config.rollout.job_type_allow_list, vec!["ALL".to_string()]);
        assert_eq!(config.kubernetes.pod_name_prefix, "fc-dep");
        assert_eq!(config.resources.memory_request, "2Gi");
        assert_eq!(config.cleanup.max_running_mins, -1);
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[queue]
batch_size = 25
failure_policy = "finalize_and_restart"

[rollout]
ramp_up_percent = 30
ramp_mode = "random"
job_type_allow_list = ["java", "command"]
proxy_user_deny_list = ["svc_acct"]

[rollout.project_version_deny_list]
"42" = 3
"not-a-number" = 9
"#;
        let config: FlowgridConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.queue.batch_size, 25);
        assert_eq!(config.queue.worker_pool_size, 10);
        assert_eq!(config.queue.failure_policy, FailurePolicy::FinalizeAndRestart);
        assert_eq!(config.rollout.ramp_up_percent, 30);
        assert_eq!(config.rollout.ramp_mode, RampMode::Random);
        assert_eq!(config.rollout.proxy_user_deny_list, vec!["svc_acct".to_string()]);

        let denials = config.project_version_denials();
        assert_eq!(denials.len(), 1);
        assert_eq!(denials.get(&42), Some(&3));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = FlowgridConfig::default();
        let rendered = config.to_toml_string().unwrap();
        let parsed: FlowgridConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.kubernetes.cluster_name, config.kubernetes.cluster_name);
        assert_eq!(parsed.vpa.fetch_timeout_secs, 120);
    }
}
