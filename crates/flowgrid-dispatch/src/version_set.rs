//! Version set resolution.
//!
//! Produces the image type → version mapping a flow container is built
//! from. A flow may pin an existing set by id; the pinned set is checked
//! against the registry, retired entries are replaced, and image types it
//! does not cover are filled in. Any change yields a new (content-addressed)
//! set; stored sets are never edited.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use flowgrid_core::config::KubernetesConfig;
use flowgrid_rollout::ImageRampupManager;
use flowgrid_state::{Execution, ImageState, StateStore, VersionInfo, VersionSet};

use crate::error::{DispatchError, DispatchResult};

/// Flow parameter pinning an existing version set.
pub const PARAM_VERSION_SET_ID: &str = "azkaban.version-set.id";

/// Flow parameter widening override states to include TEST.
pub const PARAM_ALLOW_TEST_VERSION: &str = "allow.image.test.version";

/// Flow parameter key carrying a per-type version override.
pub fn version_override_param(image_type: &str) -> String {
    format!("image.{image_type}.version")
}

/// The override for `image_type`. Image types are case-insensitive in the
/// registry, so the key matches regardless of how the type is cased.
fn version_override<'a>(execution: &'a Execution, image_type: &str) -> Option<&'a str> {
    let key = version_override_param(image_type);
    execution
        .param(&key)
        .or_else(|| {
            execution
                .flow_params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(&key))
                .map(|(_, v)| v.as_str())
        })
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Read access to the image registry.
pub trait VersionRegistry: Send + Sync {
    /// Current lifecycle state of a registered version.
    fn image_state(&self, image_type: &str, version: &str) -> DispatchResult<Option<ImageState>>;

    /// Version currently being ramped for an image type.
    fn rampup_version(&self, image_type: &str) -> DispatchResult<VersionInfo>;

    /// Latest uploaded version of a project.
    fn latest_project_version(&self, project_id: u32) -> DispatchResult<Option<u32>>;

    /// The version if it is registered in one of `allowed` states.
    fn version_info(
        &self,
        image_type: &str,
        version: &str,
        allowed: &[ImageState],
    ) -> DispatchResult<Option<VersionInfo>> {
        Ok(self
            .image_state(image_type, version)?
            .filter(|state| allowed.contains(state))
            .map(|state| VersionInfo::new(version, state)))
    }
}

/// Registry backed by the state store.
#[derive(Clone)]
pub struct StoreRegistry {
    store: StateStore,
    rampups: ImageRampupManager,
}

impl StoreRegistry {
    pub fn new(store: StateStore) -> Self {
        Self {
            rampups: ImageRampupManager::new(store.clone()),
            store,
        }
    }
}

impl VersionRegistry for StoreRegistry {
    fn image_state(&self, image_type: &str, version: &str) -> DispatchResult<Option<ImageState>> {
        Ok(self
            .store
            .get_image_version(image_type, version)?
            .map(|image| image.state))
    }

    fn rampup_version(&self, image_type: &str) -> DispatchResult<VersionInfo> {
        Ok(self.rampups.select_version(image_type)?)
    }

    fn latest_project_version(&self, project_id: u32) -> DispatchResult<Option<u32>> {
        Ok(self.store.get_project_version(project_id)?)
    }
}

pub struct VersionSetResolver {
    store: StateStore,
    registry: Arc<dyn VersionRegistry>,
    base_image_type: String,
    config_image_type: String,
    dependency_types: Vec<String>,
    bundled_job_types: BTreeSet<String>,
}

impl VersionSetResolver {
    pub fn new(
        store: StateStore,
        registry: Arc<dyn VersionRegistry>,
        config: &KubernetesConfig,
    ) -> Self {
        Self {
            store,
            registry,
            base_image_type: config.base_image_type.to_ascii_lowercase(),
            config_image_type: config.config_image_type.to_ascii_lowercase(),
            dependency_types: config
                .dependency_types
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            bundled_job_types: config
                .bundled_job_types
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn VersionRegistry> {
        &self.registry
    }

    /// Infra images, non-bundled job types, and dependency types, lower-cased.
    pub fn required_image_types(&self, execution: &Execution) -> BTreeSet<String> {
        let mut types = BTreeSet::from([
            self.base_image_type.clone(),
            self.config_image_type.clone(),
        ]);
        types.extend(
            execution
                .job_types()
                .into_iter()
                .map(|t| t.to_ascii_lowercase())
                .filter(|t| !self.bundled_job_types.contains(t)),
        );
        types.extend(self.dependency_types.iter().cloned());
        types
    }

    pub fn is_bundled(&self, job_type: &str) -> bool {
        self.bundled_job_types.contains(&job_type.to_ascii_lowercase())
    }

    fn allowed_override_states(execution: &Execution) -> Vec<ImageState> {
        let mut states = vec![ImageState::New, ImageState::Active];
        if execution.param_flag(PARAM_ALLOW_TEST_VERSION) {
            states.push(ImageState::Test);
        }
        states
    }

    /// Version for one image type: the flow's override, else the rampup pick.
    fn resolve_type(
        &self,
        execution: &Execution,
        image_type: &str,
        allowed: &[ImageState],
    ) -> DispatchResult<VersionInfo> {
        if let Some(version) = version_override(execution, image_type) {
            return self
                .registry
                .version_info(image_type, version, allowed)?
                .ok_or_else(|| DispatchError::UnregisteredOverride {
                    image_type: image_type.to_string(),
                    version: version.to_string(),
                });
        }
        self.registry.rampup_version(image_type)
    }

    fn pinned_set(&self, execution: &Execution) -> DispatchResult<Option<VersionSet>> {
        let Some(raw) = execution.param(PARAM_VERSION_SET_ID) else {
            return Ok(None);
        };
        let id = raw
            .trim()
            .parse::<u64>()
            .map_err(|_| DispatchError::VersionSetNotFound(raw.to_string()))?;
        self.store
            .get_version_set(id)?
            .map(Some)
            .ok_or_else(|| DispatchError::VersionSetNotFound(raw.to_string()))
    }

    /// Resolve a version set covering every type in `required`.
    pub fn resolve(
        &self,
        execution: &Execution,
        required: &BTreeSet<String>,
    ) -> DispatchResult<VersionSet> {
        let allowed = Self::allowed_override_states(execution);
        let pinned = self.pinned_set(execution)?;

        let mut versions: BTreeMap<String, VersionInfo> = pinned
            .as_ref()
            .map(|set| set.versions.clone())
            .unwrap_or_default();
        let mut changed = pinned.is_none();

        // Pinned entries that have since been retired.
        let stale: Vec<String> = versions
            .iter()
            .filter_map(|(image_type, info)| {
                match self.registry.image_state(image_type, &info.version) {
                    Ok(Some(state)) if !state.is_retired() => None,
                    Ok(_) => Some(Ok(image_type.clone())),
                    Err(e) => Some(Err(e)),
                }
            })
            .collect::<DispatchResult<_>>()?;
        for image_type in stale {
            let replacement = self.resolve_type(execution, &image_type, &allowed)?;
            warn!(
                execution_id = execution.id,
                %image_type,
                replacement = %replacement.version,
                "pinned version retired, replaced"
            );
            versions.insert(image_type, replacement);
            changed = true;
        }

        for image_type in required {
            if versions.contains_key(image_type) {
                continue;
            }
            let info = self.resolve_type(execution, image_type, &allowed)?;
            debug!(
                execution_id = execution.id,
                %image_type,
                version = %info.version,
                "image type resolved"
            );
            versions.insert(image_type.clone(), info);
            changed = true;
        }

        if let Some(missing) = required.iter().find(|t| !versions.contains_key(*t)) {
            return Err(DispatchError::MissingVersion {
                image_type: missing.clone(),
            });
        }

        match pinned {
            Some(set) if !changed => Ok(set),
            previous => {
                let set = self.store.get_or_create_version_set(versions)?;
                if let Some(previous) = previous {
                    info!(
                        execution_id = execution.id,
                        pinned = previous.id,
                        resolved = set.id,
                        "pinned version set superseded"
                    );
                }
                Ok(set)
            }
        }
    }
}
