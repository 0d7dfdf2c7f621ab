pub mod config;
pub mod orchestrator;
pub mod quantity;

pub use config::FlowgridConfig;
pub use orchestrator::{
    AutoscalerObject, AutoscalerSpec, ContainerOrchestrator, ContainerRecommendation,
    ContainerSpec, EnvVar, OrchestratorError, OrchestratorResult, PodInfo, PodSpec,
    ResourceRequirements, ServiceSpec, Volume, VolumeMount, VolumeSource,
};
pub use quantity::{compare_resources, Quantity, QuantityError, ResourceComparison, UnitFamily};

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
