//! Runtime administration of the dispatch engine.
//!
//! Toggles queue processing and edits the live criteria inputs. Every
//! change applies to the next decision without a restart.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use flowgrid_rollout::DispatchCriteria;

use crate::error::{DispatchError, DispatchResult};
use crate::queue::QueueProcessor;

/// One edit to the criteria inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "property", content = "value", rename_all = "snake_case")]
pub enum PropertyUpdate {
    ReplaceAllowList(Vec<String>),
    AppendAllowList(Vec<String>),
    RemoveAllowList(Vec<String>),
    ReplaceDenyList(Vec<String>),
    AppendDenyList(Vec<String>),
    RemoveDenyList(Vec<String>),
    UpdateRampUp(u32),
    SetProjectVersionDeny { project_id: u32, version: u32 },
    RemoveProjectVersionDeny { project_id: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminAction {
    EnableDispatch,
    DisableDispatch,
    UpdateProperty(PropertyUpdate),
}

/// Current dispatch settings as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchStatus {
    pub enabled: bool,
    pub ramp_up: u32,
    pub allow_list: BTreeSet<String>,
    pub deny_list: BTreeSet<String>,
    pub project_version_deny: BTreeMap<u32, u32>,
}

#[derive(Clone)]
pub struct DispatchAdmin {
    queue: Arc<QueueProcessor>,
    criteria: Arc<DispatchCriteria>,
}

impl DispatchAdmin {
    pub fn new(queue: Arc<QueueProcessor>, criteria: Arc<DispatchCriteria>) -> Self {
        Self { queue, criteria }
    }

    pub fn apply(&self, action: AdminAction) -> DispatchResult<DispatchStatus> {
        match action {
            AdminAction::EnableDispatch => self.queue.set_enabled(true),
            AdminAction::DisableDispatch => self.queue.set_enabled(false),
            AdminAction::UpdateProperty(update) => self.update_property(update)?,
        }
        Ok(self.status())
    }

    fn update_property(&self, update: PropertyUpdate) -> DispatchResult<()> {
        info!(?update, "dispatch property updated");
        let criteria = &self.criteria;
        match update {
            PropertyUpdate::ReplaceAllowList(types) => criteria.job_types().replace(types),
            PropertyUpdate::AppendAllowList(types) => criteria.job_types().append(types),
            PropertyUpdate::RemoveAllowList(types) => criteria.job_types().remove(types),
            PropertyUpdate::ReplaceDenyList(users) => criteria.proxy_users().replace(users),
            PropertyUpdate::AppendDenyList(users) => criteria.proxy_users().append(users),
            PropertyUpdate::RemoveDenyList(users) => criteria.proxy_users().remove(users),
            PropertyUpdate::UpdateRampUp(percent) => {
                if percent > 100 {
                    return Err(DispatchError::InvalidAction(format!(
                        "ramp-up must be between 0 and 100, got {percent}"
                    )));
                }
                criteria.ramp_up().set_percent(percent)?;
            }
            PropertyUpdate::SetProjectVersionDeny {
                project_id,
                version,
            } => criteria.project_versions().set(project_id, version),
            PropertyUpdate::RemoveProjectVersionDeny { project_id } => {
                criteria.project_versions().remove(project_id)
            }
        }
        Ok(())
    }

    pub fn status(&self) -> DispatchStatus {
        DispatchStatus {
            enabled: self.queue.is_enabled(),
            ramp_up: self.criteria.ramp_up().percent(),
            allow_list: self.criteria.job_types().snapshot().as_ref().clone(),
            deny_list: self.criteria.proxy_users().snapshot().as_ref().clone(),
            project_version_deny: self.criteria.project_versions().snapshot().as_ref().clone(),
        }
    }
}
