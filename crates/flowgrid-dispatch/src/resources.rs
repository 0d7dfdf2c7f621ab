//! Container resource sizing.
//!
//! Requests come from, in order: a flow parameter override, an autoscaler
//! recommendation, the configured default. Overrides and recommendations
//! are clamped to the configured maximum; anything that cannot be compared
//! against the maximum is dropped in favour of the default. Limits are the
//! request scaled by an integer multiplier, keeping the unit suffix.

use async_trait::async_trait;
use tracing::{debug, warn};

use flowgrid_core::config::ResourcesConfig;
use flowgrid_core::{compare_resources, Quantity, ResourceComparison};
use flowgrid_state::Execution;

pub const PARAM_CPU_REQUEST: &str = "flow.container.cpu.request";
pub const PARAM_MEMORY_REQUEST: &str = "flow.container.memory.request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Cpu,
    Memory,
}

impl Dimension {
    pub fn resource_name(self) -> &'static str {
        match self {
            Dimension::Cpu => "cpu",
            Dimension::Memory => "memory",
        }
    }

    fn override_param(self) -> &'static str {
        match self {
            Dimension::Cpu => PARAM_CPU_REQUEST,
            Dimension::Memory => PARAM_MEMORY_REQUEST,
        }
    }
}

/// Default, ceiling, and limit multiplier for one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub default_request: String,
    pub max_allowed: String,
    pub limit_multiplier: u32,
}

/// Recommended requests, already in orchestrator notation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecommendation {
    pub cpu: String,
    pub memory: String,
}

/// Source of per-flow resource recommendations.
#[async_trait]
pub trait ResourceRecommender: Send + Sync {
    /// `None` means "use static sizing"; failures are handled internally.
    async fn recommend(&self, execution: &Execution) -> Option<ResourceRecommendation>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sizing {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

#[derive(Debug, Clone)]
pub struct ResourceSizer {
    cpu: ResourceSpec,
    memory: ResourceSpec,
}

impl ResourceSizer {
    pub fn new(cpu: ResourceSpec, memory: ResourceSpec) -> Self {
        Self { cpu, memory }
    }

    pub fn from_config(config: &ResourcesConfig) -> Self {
        Self::new(
            ResourceSpec {
                default_request: config.cpu_request.clone(),
                max_allowed: config.max_allowed_cpu.clone(),
                limit_multiplier: config.cpu_limit_multiplier,
            },
            ResourceSpec {
                default_request: config.memory_request.clone(),
                max_allowed: config.max_allowed_memory.clone(),
                limit_multiplier: config.memory_limit_multiplier,
            },
        )
    }

    fn spec(&self, dimension: Dimension) -> &ResourceSpec {
        match dimension {
            Dimension::Cpu => &self.cpu,
            Dimension::Memory => &self.memory,
        }
    }

    /// Request for one dimension given an optional caller-supplied value.
    pub fn request(&self, dimension: Dimension, requested: Option<&str>) -> String {
        let spec = self.spec(dimension);
        let Some(requested) = requested.map(str::trim).filter(|r| !r.is_empty()) else {
            return spec.default_request.clone();
        };
        match compare_resources(&spec.max_allowed, requested) {
            ResourceComparison::Within => requested.to_string(),
            ResourceComparison::Exceeds => {
                debug!(
                    resource = dimension.resource_name(),
                    requested,
                    max = %spec.max_allowed,
                    "request clamped to maximum"
                );
                spec.max_allowed.clone()
            }
            ResourceComparison::Incomparable => {
                warn!(
                    resource = dimension.resource_name(),
                    requested,
                    max = %spec.max_allowed,
                    "request not comparable with maximum, using default"
                );
                spec.default_request.clone()
            }
        }
    }

    /// Limit for a chosen request: coefficient × multiplier, same suffix.
    pub fn limit(&self, dimension: Dimension, request: &str) -> String {
        let multiplier = self.spec(dimension).limit_multiplier.max(1);
        match Quantity::parse(request) {
            Ok(quantity) => quantity.scale(multiplier).to_string(),
            Err(_) => request.to_string(),
        }
    }

    /// Requests and limits for an execution.
    pub fn size(
        &self,
        execution: &Execution,
        recommendation: Option<&ResourceRecommendation>,
    ) -> Sizing {
        let pick = |dimension: Dimension| {
            let requested = execution
                .param(dimension.override_param())
                .or_else(|| {
                    recommendation.map(|r| match dimension {
                        Dimension::Cpu => r.cpu.as_str(),
                        Dimension::Memory => r.memory.as_str(),
                    })
                });
            let request = self.request(dimension, requested);
            let limit = self.limit(dimension, &request);
            (request, limit)
        };
        let (cpu_request, cpu_limit) = pick(Dimension::Cpu);
        let (memory_request, memory_limit) = pick(Dimension::Memory);
        Sizing {
            cpu_request,
            cpu_limit,
            memory_request,
            memory_limit,
        }
    }
}
