//! Container orchestrator contract.
//!
//! The dispatch engine never talks to a cluster API directly. It builds
//! [`PodSpec`]s and hands them to a [`ContainerOrchestrator`], which the
//! daemon backs with an HTTP client and tests back with in-memory mocks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator request failed: {0}")]
    Request(String),

    #[error("orchestrator returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("orchestrator call timed out after {0}s")]
    Timeout(u64),

    #[error("invalid orchestrator payload: {0}")]
    Decode(String),
}

// ── Pods ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<EnvVar>,
    pub resources: ResourceRequirements,
    pub volume_mounts: Vec<VolumeMount>,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSource {
    EmptyDir,
    Secret { secret_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

/// Everything needed to create one flow container pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub init_containers: Vec<ContainerSpec>,
    pub containers: Vec<ContainerSpec>,
    pub volumes: Vec<Volume>,
    /// Static manifest the generated fields are merged over.
    pub template: Option<Value>,
}

impl PodSpec {
    /// Render as an orchestrator pod manifest.
    ///
    /// When a template is present the generated manifest is merged over it:
    /// objects merge key by key, everything else (including arrays) is
    /// replaced by the generated value.
    pub fn to_manifest(&self) -> Value {
        let generated = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "labels": self.labels,
                "annotations": self.annotations,
            },
            "spec": {
                "restartPolicy": "Never",
                "initContainers": self.init_containers.iter().map(container_manifest).collect::<Vec<_>>(),
                "containers": self.containers.iter().map(container_manifest).collect::<Vec<_>>(),
                "volumes": self.volumes.iter().map(volume_manifest).collect::<Vec<_>>(),
            },
        });

        match &self.template {
            Some(template) => {
                let mut merged = template.clone();
                merge_json(&mut merged, generated);
                merged
            }
            None => generated,
        }
    }
}

fn container_manifest(c: &ContainerSpec) -> Value {
    let mut value = json!({
        "name": c.name,
        "image": c.image,
        "imagePullPolicy": "IfNotPresent",
        "env": c.env.iter().map(|e| json!({ "name": e.name, "value": e.value })).collect::<Vec<_>>(),
        "volumeMounts": c.volume_mounts.iter().map(|m| json!({
            "name": m.name,
            "mountPath": m.mount_path,
            "readOnly": m.read_only,
        })).collect::<Vec<_>>(),
        "resources": {
            "requests": c.resources.requests,
            "limits": c.resources.limits,
        },
    });
    if !c.command.is_empty() {
        value["command"] = json!(c.command);
    }
    value
}

fn volume_manifest(v: &Volume) -> Value {
    match &v.source {
        VolumeSource::EmptyDir => json!({ "name": v.name, "emptyDir": {} }),
        VolumeSource::Secret { secret_name } => json!({
            "name": v.name,
            "secret": { "secretName": secret_name },
        }),
    }
}

/// Deep-merge `overlay` into `base`.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Summary of a live pod, as returned by label listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: u64,
}

// ── Services ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub namespace: String,
    pub selector: BTreeMap<String, String>,
    pub port: u16,
}

impl ServiceSpec {
    pub fn to_manifest(&self) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": self.name, "namespace": self.namespace },
            "spec": {
                "selector": self.selector,
                "ports": [{ "port": self.port, "targetPort": self.port, "protocol": "TCP" }],
            },
        })
    }
}

// ── Autoscaler ─────────────────────────────────────────────────────

/// Request to create a vertical autoscaler object for one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerSpec {
    pub name: String,
    pub namespace: String,
    pub container_name: String,
    pub target_labels: BTreeMap<String, String>,
    pub min_allowed: BTreeMap<String, String>,
    pub max_allowed: BTreeMap<String, String>,
    /// Always "Off": the object only observes and recommends.
    pub update_mode: String,
}

impl AutoscalerSpec {
    pub fn to_manifest(&self) -> Value {
        json!({
            "apiVersion": "autoscaling.k8s.io/v1",
            "kind": "VerticalPodAutoscaler",
            "metadata": { "name": self.name, "namespace": self.namespace },
            "spec": {
                "selector": { "matchLabels": self.target_labels },
                "updatePolicy": { "updateMode": self.update_mode },
                "resourcePolicy": {
                    "containerPolicies": [{
                        "containerName": self.container_name,
                        "minAllowed": self.min_allowed,
                        "maxAllowed": self.max_allowed,
                    }],
                },
            },
        })
    }
}

/// Raw recommendation for one container, in base units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecommendation {
    pub container_name: String,
    /// Cores.
    pub cpu: f64,
    /// Bytes.
    pub memory: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerObject {
    pub name: String,
    pub created_at: u64,
    pub recommendations: Vec<ContainerRecommendation>,
}

// ── Trait ──────────────────────────────────────────────────────────

#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    /// Create a pod. Fails with `AlreadyExists` for a duplicate name.
    async fn create_pod(&self, spec: &PodSpec) -> OrchestratorResult<()>;

    /// Delete a pod. A missing pod is not an error.
    async fn delete_pod(&self, name: &str) -> OrchestratorResult<()>;

    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<()>;

    /// Delete a service. A missing service is not an error.
    async fn delete_service(&self, name: &str) -> OrchestratorResult<()>;

    /// List pods matching a `key=value` label selector.
    async fn list_pods(&self, label_selector: &str) -> OrchestratorResult<Vec<PodInfo>>;

    async fn get_autoscaler(&self, name: &str) -> OrchestratorResult<Option<AutoscalerObject>>;

    async fn create_autoscaler(&self, spec: &AutoscalerSpec) -> OrchestratorResult<()>;
}
