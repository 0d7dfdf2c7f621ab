//! Flow container pod requests.
//!
//! The pod runs one flow container built from the base image. Every job
//! type not baked into the base image, and every dependency type, gets an
//! init container that copies its payload into an `emptyDir` volume the
//! flow container also mounts.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use flowgrid_core::config::KubernetesConfig;
use flowgrid_core::{
    ContainerSpec, EnvVar, PodSpec, ResourceRequirements, ServiceSpec, Volume, VolumeMount,
    VolumeSource,
};
use flowgrid_state::{Execution, ExecutionId, VersionSet};

use crate::error::{DispatchError, DispatchResult};
use crate::resources::Sizing;

pub const FLOW_POD_APP_LABEL: &str = "flowgrid-flow";
pub const LABEL_APP: &str = "app";
pub const LABEL_CLUSTER: &str = "cluster";
pub const LABEL_EXECUTION_ID: &str = "execution-id";
pub const LABEL_FLOW: &str = "flow";

pub const PARAM_JAVA_DEBUG: &str = "java.enable.debug";
pub const PARAM_DEV_POD: &str = "enable.dev.pod";
pub const PARAM_ENV_PREFIX: &str = "pod.env.var.";

pub const ENV_EXECUTION_ID: &str = "FLOW_EXECUTION_ID";
pub const ENV_VERSION_SET_ID: &str = "VERSION_SET_ID";
pub const ENV_CLUSTER: &str = "AZ_CLUSTER";
pub const ENV_CONF_VERSION: &str = "AZ_CONF_VERSION";
pub const ENV_JAVA_DEBUG: &str = "JAVA_ENABLE_DEBUG";
pub const ENV_DEV_POD: &str = "ENABLE_DEV_POD";
pub const ENV_CPU_REQUEST: &str = "CPU_REQUEST";
pub const ENV_MEMORY_REQUEST: &str = "MEMORY_REQUEST";

#[derive(Debug, Clone, Copy)]
enum InitKind {
    JobType,
    Dependency,
}

impl InitKind {
    fn volume_prefix(self) -> &'static str {
        match self {
            InitKind::JobType => "jobtype-volume-",
            InitKind::Dependency => "dependency-volume-",
        }
    }

    fn init_prefix(self) -> &'static str {
        match self {
            InitKind::JobType => "jobtype-init-",
            InitKind::Dependency => "dependency-init-",
        }
    }

    fn mount_path_env(self) -> &'static str {
        match self {
            InitKind::JobType => "JOBTYPE_MOUNT_PATH",
            InitKind::Dependency => "DEPENDENCY_MOUNT_PATH",
        }
    }
}

/// A pod plus the service that fronts it, when services are enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct PodRequest {
    pub pod: PodSpec,
    pub service: Option<ServiceSpec>,
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: value.into(),
    }
}

pub fn pod_name(config: &KubernetesConfig, id: ExecutionId) -> String {
    format!("{}-{}-{id}", config.pod_name_prefix, config.cluster_name)
}

/// `project.flow` reduced to a valid label value: lowercase alphanumerics
/// and `-`, at most 63 characters, alphanumeric at both ends.
pub fn flow_label_value(execution: &Execution) -> String {
    let raw: String = execution
        .flow_name()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = raw.trim_matches('-');
    let truncated: String = trimmed.chars().take(63).collect();
    truncated.trim_end_matches('-').to_string()
}

pub fn service_name(config: &KubernetesConfig, id: ExecutionId) -> String {
    format!("{}-{}-{id}", config.service_name_prefix, config.cluster_name)
}

#[derive(Debug, Clone)]
pub struct PodRequestBuilder {
    config: KubernetesConfig,
}

impl PodRequestBuilder {
    pub fn new(config: KubernetesConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KubernetesConfig {
        &self.config
    }

    pub fn pod_name(&self, id: ExecutionId) -> String {
        pod_name(&self.config, id)
    }

    pub fn service_name(&self, id: ExecutionId) -> String {
        service_name(&self.config, id)
    }

    pub fn image(&self, image_type: &str, version: &str) -> String {
        format!("{}/{image_type}:{version}", self.config.image_registry)
    }

    fn labels(&self, execution: &Execution) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_APP.to_string(), FLOW_POD_APP_LABEL.to_string()),
            (LABEL_CLUSTER.to_string(), self.config.cluster_name.clone()),
            (LABEL_EXECUTION_ID.to_string(), execution.id.to_string()),
            (LABEL_FLOW.to_string(), flow_label_value(execution)),
        ])
    }

    fn load_template(path: &Path) -> DispatchResult<Value> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::Template(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| DispatchError::Template(format!("{}: {e}", path.display())))
    }

    fn flow_env(&self, execution: &Execution, set: &VersionSet, sizing: &Sizing) -> Vec<EnvVar> {
        let mut vars = vec![
            env(ENV_CLUSTER, self.config.cluster_name.clone()),
            env(ENV_EXECUTION_ID, execution.id.to_string()),
            env(ENV_VERSION_SET_ID, set.id.to_string()),
            env(ENV_CPU_REQUEST, sizing.cpu_request.clone()),
            env(ENV_MEMORY_REQUEST, sizing.memory_request.clone()),
        ];
        if let Some(conf) = set.version(&self.config.config_image_type) {
            vars.push(env(ENV_CONF_VERSION, conf.version.clone()));
        }
        if execution.param_flag(PARAM_JAVA_DEBUG) {
            vars.push(env(ENV_JAVA_DEBUG, "true"));
        }
        if execution.param_flag(PARAM_DEV_POD) {
            vars.push(env(ENV_DEV_POD, "true"));
        }
        for (key, value) in &execution.flow_params {
            if let Some(name) = key.strip_prefix(PARAM_ENV_PREFIX).filter(|n| !n.is_empty()) {
                vars.push(env(&name.to_ascii_uppercase(), value.clone()));
            }
        }
        vars
    }

    /// Build the pod (and service) for an execution.
    pub fn build(
        &self,
        execution: &Execution,
        set: &VersionSet,
        sizing: &Sizing,
    ) -> DispatchResult<PodRequest> {
        let base_type = &self.config.base_image_type;
        let base = set
            .version(base_type)
            .ok_or_else(|| DispatchError::MissingVersion {
                image_type: base_type.clone(),
            })?;

        let mut init_containers = Vec::new();
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();

        let bundled: Vec<String> = self
            .config
            .bundled_job_types
            .iter()
            .map(|t| t.to_ascii_lowercase())
            .collect();
        let job_types = execution
            .job_types()
            .into_iter()
            .map(|t| t.to_ascii_lowercase())
            .filter(|t| !bundled.contains(t))
            .map(|t| (t, InitKind::JobType));
        let dependencies = self
            .config
            .dependency_types
            .iter()
            .map(|t| (t.to_ascii_lowercase(), InitKind::Dependency));

        for (image_type, kind) in job_types.chain(dependencies) {
            let info = set
                .version(&image_type)
                .ok_or_else(|| DispatchError::MissingVersion {
                    image_type: image_type.clone(),
                })?;
            let (init_path, app_path) = match kind {
                InitKind::JobType => (
                    &self.config.init_mount_path_for_jobtypes,
                    &self.config.mount_path_for_jobtypes,
                ),
                InitKind::Dependency => (
                    &self.config.init_mount_path_for_dependencies,
                    &self.config.mount_path_for_dependencies,
                ),
            };
            let volume = format!("{}{image_type}", kind.volume_prefix());
            volumes.push(Volume {
                name: volume.clone(),
                source: VolumeSource::EmptyDir,
            });
            mounts.push(VolumeMount {
                name: volume.clone(),
                mount_path: format!("{app_path}/{image_type}"),
                read_only: false,
            });
            init_containers.push(ContainerSpec {
                name: format!("{}{image_type}", kind.init_prefix()),
                image: self.image(&image_type, &info.version),
                env: vec![
                    env(ENV_CLUSTER, self.config.cluster_name.clone()),
                    env(kind.mount_path_env(), init_path.clone()),
                ],
                resources: ResourceRequirements::default(),
                volume_mounts: vec![VolumeMount {
                    name: volume,
                    mount_path: init_path.clone(),
                    read_only: false,
                }],
                command: Vec::new(),
            });
        }

        if let Some(secret) = &self.config.secret_name {
            volumes.push(Volume {
                name: self.config.secret_volume.clone(),
                source: VolumeSource::Secret {
                    secret_name: secret.clone(),
                },
            });
            mounts.push(VolumeMount {
                name: self.config.secret_volume.clone(),
                mount_path: self.config.secret_mount_path.clone(),
                read_only: true,
            });
        }

        let flow_container = ContainerSpec {
            name: self.config.flow_container_name.clone(),
            image: self.image(base_type, &base.version),
            env: self.flow_env(execution, set, sizing),
            resources: ResourceRequirements {
                requests: BTreeMap::from([
                    ("cpu".to_string(), sizing.cpu_request.clone()),
                    ("memory".to_string(), sizing.memory_request.clone()),
                ]),
                limits: BTreeMap::from([
                    ("cpu".to_string(), sizing.cpu_limit.clone()),
                    ("memory".to_string(), sizing.memory_limit.clone()),
                ]),
            },
            volume_mounts: mounts,
            command: Vec::new(),
        };

        let template = self
            .config
            .pod_template_path
            .as_deref()
            .map(Self::load_template)
            .transpose()?;

        let labels = self.labels(execution);
        let pod = PodSpec {
            name: self.pod_name(execution.id),
            namespace: self.config.namespace.clone(),
            labels: labels.clone(),
            annotations: BTreeMap::new(),
            init_containers,
            containers: vec![flow_container],
            volumes,
            template,
        };
        debug!(
            execution_id = execution.id,
            pod = %pod.name,
            init_containers = pod.init_containers.len(),
            "pod request built"
        );

        let service = self.config.service_required.then(|| ServiceSpec {
            name: self.service_name(execution.id),
            namespace: self.config.namespace.clone(),
            selector: BTreeMap::from([
                (LABEL_APP.to_string(), FLOW_POD_APP_LABEL.to_string()),
                (LABEL_EXECUTION_ID.to_string(), execution.id.to_string()),
            ]),
            port: self.config.service_port,
        });

        Ok(PodRequest { pod, service })
    }
}
