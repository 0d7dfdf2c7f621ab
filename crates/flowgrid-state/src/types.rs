//! Domain types for the Flowgrid state store.
//!
//! These types represent persisted executions, version sets, the image
//! registry, and execution log lines. All types are serializable to/from
//! JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use flowgrid_core::epoch_millis;

use crate::flow::{self, FlowNode};

/// Unique identifier for an execution.
pub type ExecutionId = u64;

/// Unique identifier for a version set.
pub type VersionSetId = u64;

// ── Execution ──────────────────────────────────────────────────────

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ready,
    Dispatching,
    Preparing,
    Running,
    Paused,
    Killing,
    ExecutionStopped,
    FailedFinishing,
    Failed,
    Succeeded,
    Killed,
    Cancelled,
}

/// Which timestamp decides how long an execution has been in a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleClock {
    Submitted,
    Started,
    Updated,
}

impl Status {
    pub const ALL: [Status; 12] = [
        Status::Ready,
        Status::Dispatching,
        Status::Preparing,
        Status::Running,
        Status::Paused,
        Status::Killing,
        Status::ExecutionStopped,
        Status::FailedFinishing,
        Status::Failed,
        Status::Succeeded,
        Status::Killed,
        Status::Cancelled,
    ];

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            Status::Failed | Status::Succeeded | Status::Killed | Status::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ready => "READY",
            Status::Dispatching => "DISPATCHING",
            Status::Preparing => "PREPARING",
            Status::Running => "RUNNING",
            Status::Paused => "PAUSED",
            Status::Killing => "KILLING",
            Status::ExecutionStopped => "EXECUTION_STOPPED",
            Status::FailedFinishing => "FAILED_FINISHING",
            Status::Failed => "FAILED",
            Status::Succeeded => "SUCCEEDED",
            Status::Killed => "KILLED",
            Status::Cancelled => "CANCELLED",
        }
    }

    /// Timestamp used to measure time spent in this status.
    pub fn stale_clock(self) -> StaleClock {
        match self {
            Status::Ready | Status::Dispatching | Status::Preparing => StaleClock::Submitted,
            Status::Running | Status::Paused | Status::FailedFinishing => StaleClock::Started,
            _ => StaleClock::Updated,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown status: {s}"))
    }
}

/// Where an execution runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchMethod {
    /// One isolated container per execution.
    Containerized,
    /// Legacy shared executors polling the store.
    Poll,
}

/// One run of a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    /// Assigned by the store on insert.
    pub id: ExecutionId,
    pub project_id: u32,
    pub project_name: String,
    pub project_version: u32,
    pub flow_id: String,
    pub status: Status,
    pub dispatch_method: DispatchMethod,
    pub submit_user: String,
    /// Unix timestamps in milliseconds.
    pub submit_time: u64,
    pub start_time: Option<u64>,
    pub update_time: u64,
    pub end_time: Option<u64>,
    pub flow_params: BTreeMap<String, String>,
    /// Flow-level proxy user; job nodes may override it.
    pub proxy_user: Option<String>,
    /// Proxy users attached explicitly at submit time.
    pub proxy_users: BTreeSet<String>,
    pub nodes: Vec<FlowNode>,
    pub version_set_id: Option<VersionSetId>,
    pub restart_of: Option<ExecutionId>,
    pub attempt: u32,
    /// Times this execution went back to READY after a failed dispatch.
    #[serde(default)]
    pub dispatch_attempts: u32,
    pub error: Option<String>,
}

impl Execution {
    /// A new READY execution that has not been stored yet.
    pub fn new(project_id: u32, project_name: &str, flow_id: &str, submit_user: &str) -> Self {
        let now = epoch_millis();
        Self {
            id: 0,
            project_id,
            project_name: project_name.to_string(),
            project_version: 0,
            flow_id: flow_id.to_string(),
            status: Status::Ready,
            dispatch_method: DispatchMethod::Containerized,
            submit_user: submit_user.to_string(),
            submit_time: now,
            start_time: None,
            update_time: now,
            end_time: None,
            flow_params: BTreeMap::new(),
            proxy_user: None,
            proxy_users: BTreeSet::new(),
            nodes: Vec::new(),
            version_set_id: None,
            restart_of: None,
            attempt: 0,
            dispatch_attempts: 0,
            error: None,
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<FlowNode>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.flow_params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_proxy_user(mut self, user: &str) -> Self {
        self.proxy_user = Some(user.to_string());
        self
    }

    /// Composite key used in the executions table.
    pub fn table_key(&self) -> String {
        execution_key(self.id)
    }

    /// Fully-qualified flow name: `{project}.{flow}`.
    pub fn flow_name(&self) -> String {
        format!("{}.{}", self.project_name, self.flow_id)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.flow_params.get(key).map(String::as_str)
    }

    /// True when the flow parameter is present and equals "true" (any case).
    pub fn param_flag(&self, key: &str) -> bool {
        self.param(key)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    }

    /// Distinct job types of enabled nodes, including embedded sub-flows.
    pub fn job_types(&self) -> BTreeSet<String> {
        flow::collect_job_types(&self.nodes)
    }

    /// Every proxy user the flow will run as.
    pub fn required_proxy_users(&self) -> BTreeSet<String> {
        let mut users = self.proxy_users.clone();
        users.extend(flow::collect_proxy_users(&self.nodes, self.proxy_user.as_deref()));
        if self.nodes.is_empty() {
            if let Some(user) = &self.proxy_user {
                users.insert(user.clone());
            }
        }
        users
    }

    /// Timestamp compared against the cutoff when looking for stale rows.
    pub fn clock_time(&self, clock: StaleClock) -> u64 {
        match clock {
            StaleClock::Submitted => self.submit_time,
            StaleClock::Started => self.start_time.unwrap_or(self.submit_time),
            StaleClock::Updated => self.update_time,
        }
    }
}

pub(crate) fn execution_key(id: ExecutionId) -> String {
    format!("{id:020}")
}

// ── Image registry ─────────────────────────────────────────────────

/// Lifecycle state of a registered image version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageState {
    New,
    Active,
    Test,
    Unstable,
    Deprecated,
}

impl ImageState {
    /// Retired versions must not be handed to new containers.
    pub fn is_retired(self) -> bool {
        matches!(self, ImageState::Unstable | ImageState::Deprecated)
    }
}

/// A version of an image type known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageVersion {
    pub image_type: String,
    pub version: String,
    pub state: ImageState,
    pub created_at: u64,
}

impl ImageVersion {
    pub fn table_key(&self) -> String {
        image_version_key(&self.image_type, &self.version)
    }
}

pub(crate) fn image_version_key(image_type: &str, version: &str) -> String {
    format!("{}:{version}", image_type.to_ascii_lowercase())
}

/// One slice of a rampup plan for an image type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRampup {
    pub version: String,
    /// Share of flows, 0..=100. A complete plan sums to 100.
    pub percent: u32,
}

// ── Version sets ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionInfo {
    pub version: String,
    pub state: ImageState,
}

impl VersionInfo {
    pub fn new(version: &str, state: ImageState) -> Self {
        Self {
            version: version.to_string(),
            state,
        }
    }
}

/// Immutable image type → version mapping shared by executions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionSet {
    pub id: VersionSetId,
    /// Content digest over the sorted `type=version` pairs.
    pub digest: String,
    pub versions: BTreeMap<String, VersionInfo>,
    pub created_at: u64,
}

impl VersionSet {
    pub fn table_key(&self) -> String {
        version_set_key(self.id)
    }

    pub fn version(&self, image_type: &str) -> Option<&VersionInfo> {
        self.versions.get(&image_type.to_ascii_lowercase())
    }

    /// Stable digest of a mapping; equal mappings always share one digest.
    pub fn digest_of(versions: &BTreeMap<String, VersionInfo>) -> String {
        let mut hasher = Sha256::new();
        for (image_type, info) in versions {
            hasher.update(image_type.as_bytes());
            hasher.update(b"=");
            hasher.update(info.version.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

pub(crate) fn version_set_key(id: VersionSetId) -> String {
    format!("{id:020}")
}

// ── Execution logs ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogLine {
    pub execution_id: ExecutionId,
    pub at: u64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert_eq!("ready".parse::<Status>().unwrap(), Status::Ready);
        assert!("BOGUS".parse::<Status>().is_err());
    }

    #[test]
    fn finished_statuses() {
        assert!(Status::Succeeded.is_finished());
        assert!(Status::Failed.is_finished());
        assert!(Status::Killed.is_finished());
        assert!(!Status::Killing.is_finished());
        assert!(!Status::Ready.is_finished());
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&Status::ExecutionStopped).unwrap();
        assert_eq!(json, "\"EXECUTION_STOPPED\"");
    }

    #[test]
    fn stale_clock_per_status() {
        assert_eq!(Status::Dispatching.stale_clock(), StaleClock::Submitted);
        assert_eq!(Status::Preparing.stale_clock(), StaleClock::Submitted);
        assert_eq!(Status::Running.stale_clock(), StaleClock::Started);
        assert_eq!(Status::Killing.stale_clock(), StaleClock::Updated);
        assert_eq!(Status::ExecutionStopped.stale_clock(), StaleClock::Updated);
    }

    #[test]
    fn started_clock_falls_back_to_submit() {
        let mut exec = Execution::new(1, "proj", "flow", "alice");
        exec.submit_time = 100;
        assert_eq!(exec.clock_time(StaleClock::Started), 100);
        exec.start_time = Some(250);
        assert_eq!(exec.clock_time(StaleClock::Started), 250);
    }

    #[test]
    fn flow_name_and_flags() {
        let exec = Execution::new(1, "proj", "flowA", "alice")
            .with_param("enable.dev.pod", "TRUE")
            .with_param("java.enable.debug", "no");
        assert_eq!(exec.flow_name(), "proj.flowA");
        assert!(exec.param_flag("enable.dev.pod"));
        assert!(!exec.param_flag("java.enable.debug"));
        assert!(!exec.param_flag("missing"));
    }

    #[test]
    fn digest_ignores_state_and_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("spark".to_string(), VersionInfo::new("1.0", ImageState::Active));
        a.insert("java".to_string(), VersionInfo::new("2.0", ImageState::Active));
        let mut b = BTreeMap::new();
        b.insert("java".to_string(), VersionInfo::new("2.0", ImageState::New));
        b.insert("spark".to_string(), VersionInfo::new("1.0", ImageState::Active));
        assert_eq!(VersionSet::digest_of(&a), VersionSet::digest_of(&b));

        b.insert("spark".to_string(), VersionInfo::new("1.1", ImageState::Active));
        assert_ne!(VersionSet::digest_of(&a), VersionSet::digest_of(&b));
    }
}
