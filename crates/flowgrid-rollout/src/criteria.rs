//! Dispatch criteria chain.
//!
//! Rules run in a fixed order and the first decisive rule wins:
//!
//! 1. `dispatch.execution.to.container` flow parameter
//! 2. `useExecutor` flow parameter (forces the shared executors)
//! 3. ramp-up; anything outside the ramp stops here
//! 4. job-type allow-list
//! 5. proxy-user deny-list
//! 6. project-version deny-list
//!
//! If nothing vetoes, the execution goes to a container.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use flowgrid_core::config::RolloutConfig;
use flowgrid_state::{DispatchMethod, Execution};

use crate::error::RolloutResult;
use crate::lists::{JobTypeAllowList, ProjectVersionDenyList, ProxyUserDenyList};
use crate::ramp::RampUp;

/// Boolean flow parameter that forces the dispatch method.
pub const PARAM_DISPATCH_TO_CONTAINER: &str = "dispatch.execution.to.container";

/// Flow parameter naming a specific shared executor.
pub const PARAM_USE_EXECUTOR: &str = "useExecutor";

/// The rule that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    FlowParamOverride,
    UseExecutor,
    RampUp,
    JobTypeAllowList,
    ProxyUserDenyList,
    ProjectVersionDenyList,
    Default,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rule::FlowParamOverride => "flow_param_override",
            Rule::UseExecutor => "use_executor",
            Rule::RampUp => "ramp_up",
            Rule::JobTypeAllowList => "job_type_allow_list",
            Rule::ProxyUserDenyList => "proxy_user_deny_list",
            Rule::ProjectVersionDenyList => "project_version_deny_list",
            Rule::Default => "default",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub method: DispatchMethod,
    pub rule: Rule,
}

impl Decision {
    fn new(method: DispatchMethod, rule: Rule) -> Self {
        Self { method, rule }
    }
}

/// The ordered set of dispatch rules with their live, mutable inputs.
#[derive(Debug)]
pub struct DispatchCriteria {
    ramp_up: RampUp,
    job_types: JobTypeAllowList,
    proxy_users: ProxyUserDenyList,
    project_versions: ProjectVersionDenyList,
}

impl DispatchCriteria {
    pub fn new(
        ramp_up: RampUp,
        job_types: JobTypeAllowList,
        proxy_users: ProxyUserDenyList,
        project_versions: ProjectVersionDenyList,
    ) -> Self {
        Self {
            ramp_up,
            job_types,
            proxy_users,
            project_versions,
        }
    }

    pub fn from_config(config: &RolloutConfig) -> RolloutResult<Self> {
        let project_versions: BTreeMap<u32, u32> = config
            .project_version_deny_list
            .iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|id| (id, *v)))
            .collect();
        Ok(Self::new(
            RampUp::new(config.ramp_up_percent, config.ramp_mode)?,
            JobTypeAllowList::new(&config.job_type_allow_list),
            ProxyUserDenyList::new(&config.proxy_user_deny_list),
            ProjectVersionDenyList::new(project_versions),
        ))
    }

    pub fn ramp_up(&self) -> &RampUp {
        &self.ramp_up
    }

    pub fn job_types(&self) -> &JobTypeAllowList {
        &self.job_types
    }

    pub fn proxy_users(&self) -> &ProxyUserDenyList {
        &self.proxy_users
    }

    pub fn project_versions(&self) -> &ProjectVersionDenyList {
        &self.project_versions
    }

    /// Run the chain for one execution.
    pub fn decide(&self, execution: &Execution) -> Decision {
        let flow = execution.flow_name();
        let decision = self.evaluate(execution, &flow);
        debug!(
            execution_id = execution.id,
            %flow,
            rule = %decision.rule,
            method = ?decision.method,
            "dispatch method decided"
        );
        decision
    }

    pub fn dispatch_method(&self, execution: &Execution) -> DispatchMethod {
        self.decide(execution).method
    }

    fn evaluate(&self, execution: &Execution, flow: &str) -> Decision {
        if let Some(value) = execution.param(PARAM_DISPATCH_TO_CONTAINER) {
            match value.trim().to_ascii_lowercase().as_str() {
                "true" => return Decision::new(DispatchMethod::Containerized, Rule::FlowParamOverride),
                "false" => return Decision::new(DispatchMethod::Poll, Rule::FlowParamOverride),
                _ => {}
            }
        }

        if execution.param(PARAM_USE_EXECUTOR).is_some() {
            return Decision::new(DispatchMethod::Poll, Rule::UseExecutor);
        }

        if !self.ramp_up.admits(flow) {
            return Decision::new(DispatchMethod::Poll, Rule::RampUp);
        }

        let job_types = execution.job_types();
        if let Some(job_type) = self.job_types.first_disallowed(&job_types) {
            debug!(%flow, %job_type, "job type not allowed in containers");
            return Decision::new(DispatchMethod::Poll, Rule::JobTypeAllowList);
        }

        let users = execution.required_proxy_users();
        if let Some(user) = self.proxy_users.first_denied(&users) {
            debug!(%flow, %user, "proxy user denied from containers");
            return Decision::new(DispatchMethod::Poll, Rule::ProxyUserDenyList);
        }

        if self
            .project_versions
            .denies(execution.project_id, execution.project_version)
        {
            return Decision::new(DispatchMethod::Poll, Rule::ProjectVersionDenyList);
        }

        Decision::new(DispatchMethod::Containerized, Rule::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrid_core::config::RampMode;
    use flowgrid_state::FlowNode;

    fn criteria(percent: u32, allow: &[&str], deny: &[&str]) -> DispatchCriteria {
        DispatchCriteria::new(
            RampUp::new(percent, RampMode::Deterministic).unwrap(),
            JobTypeAllowList::new(allow),
            ProxyUserDenyList::new(deny),
            ProjectVersionDenyList::new(BTreeMap::new()),
        )
    }

    fn flow(name: &str, job_types: &[&str]) -> Execution {
        let nodes = job_types
            .iter()
            .enumerate()
            .map(|(i, t)| FlowNode::job(&format!("job{i}"), t))
            .collect();
        Execution::new(1, "proj", name, "alice").with_nodes(nodes)
    }

    #[test]
    fn ramp_up_decides_by_bucket() {
        let chain = criteria(30, &["ALL"], &[]);
        // proj.flow5 → bucket 15, proj.flow16 → bucket 85
        let a = chain.decide(&flow("flow5", &["java"]));
        assert_eq!(a, Decision::new(DispatchMethod::Containerized, Rule::Default));
        let b = chain.decide(&flow("flow16", &["java"]));
        assert_eq!(b, Decision::new(DispatchMethod::Poll, Rule::RampUp));
    }

    #[test]
    fn zero_ramp_short_circuits() {
        let chain = criteria(0, &["ALL"], &[]);
        let decision = chain.decide(&flow("flow5", &["java"]));
        assert_eq!(decision.rule, Rule::RampUp);
        assert_eq!(decision.method, DispatchMethod::Poll);
    }

    #[test]
    fn disallowed_job_type_goes_to_poll() {
        let chain = criteria(100, &["java", "command"], &[]);
        let decision = chain.decide(&flow("flow5", &["java", "pig"]));
        assert_eq!(decision, Decision::new(DispatchMethod::Poll, Rule::JobTypeAllowList));

        let decision = chain.decide(&flow("flow5", &["java", "command"]));
        assert_eq!(decision.method, DispatchMethod::Containerized);
    }

    #[test]
    fn all_sentinel_ignores_job_types() {
        let chain = criteria(100, &["ALL"], &[]);
        let decision = chain.decide(&flow("flow5", &["pig", "hive", "exotic"]));
        assert_eq!(decision.method, DispatchMethod::Containerized);
    }

    #[test]
    fn denied_proxy_user_goes_to_poll() {
        let chain = criteria(100, &["ALL"], &["svc_acct"]);
        let mut exec = flow("flow5", &["java"]);
        exec.proxy_users.insert("svc_acct".to_string());
        exec.proxy_users.insert("alice".to_string());
        let decision = chain.decide(&exec);
        assert_eq!(decision, Decision::new(DispatchMethod::Poll, Rule::ProxyUserDenyList));
    }

    #[test]
    fn proxy_user_from_node_override_is_checked() {
        let chain = criteria(100, &["ALL"], &["svc_acct"]);
        let exec = Execution::new(1, "proj", "flow5", "alice")
            .with_proxy_user("alice")
            .with_nodes(vec![FlowNode::job("a", "java").run_as("svc_acct")]);
        assert_eq!(chain.dispatch_method(&exec), DispatchMethod::Poll);
    }

    #[test]
    fn project_version_deny() {
        let chain = criteria(100, &["ALL"], &[]);
        chain.project_versions().set(1, 5);
        let mut exec = flow("flow5", &["java"]);
        exec.project_version = 5;
        assert_eq!(
            chain.decide(&exec),
            Decision::new(DispatchMethod::Poll, Rule::ProjectVersionDenyList)
        );
        exec.project_version = 6;
        assert_eq!(chain.dispatch_method(&exec), DispatchMethod::Containerized);
    }

    #[test]
    fn flow_param_override_beats_everything() {
        let chain = criteria(0, &["java"], &["alice"]);
        let exec = flow("flow16", &["pig"])
            .with_proxy_user("alice")
            .with_param(PARAM_DISPATCH_TO_CONTAINER, "TRUE")
            .with_param(PARAM_USE_EXECUTOR, "3");
        assert_eq!(
            chain.decide(&exec),
            Decision::new(DispatchMethod::Containerized, Rule::FlowParamOverride)
        );

        let exec = flow("flow5", &["java"]).with_param(PARAM_DISPATCH_TO_CONTAINER, "false");
        let chain = criteria(100, &["ALL"], &[]);
        assert_eq!(
            chain.decide(&exec),
            Decision::new(DispatchMethod::Poll, Rule::FlowParamOverride)
        );
    }

    #[test]
    fn use_executor_forces_poll() {
        let chain = criteria(100, &["ALL"], &[]);
        let exec = flow("flow5", &["java"]).with_param(PARAM_USE_EXECUTOR, "12");
        assert_eq!(
            chain.decide(&exec),
            Decision::new(DispatchMethod::Poll, Rule::UseExecutor)
        );
    }

    #[test]
    fn unparseable_override_is_ignored() {
        let chain = criteria(100, &["ALL"], &[]);
        let exec = flow("flow5", &["java"]).with_param(PARAM_DISPATCH_TO_CONTAINER, "maybe");
        assert_eq!(chain.decide(&exec).rule, Rule::Default);
    }

    #[test]
    fn live_updates_apply_to_next_decision() {
        let chain = criteria(100, &["java"], &[]);
        let exec = flow("flow5", &["java", "pig"]);
        assert_eq!(chain.dispatch_method(&exec), DispatchMethod::Poll);
        chain.job_types().append(["pig"]);
        assert_eq!(chain.dispatch_method(&exec), DispatchMethod::Containerized);
        chain.ramp_up().set_percent(0).unwrap();
        assert_eq!(chain.dispatch_method(&exec), DispatchMethod::Poll);
    }

    #[test]
    fn from_config_reads_all_lists() {
        let mut config = RolloutConfig::default();
        config.ramp_up_percent = 100;
        config.job_type_allow_list = vec!["java".to_string()];
        config.proxy_user_deny_list = vec!["svc_acct".to_string()];
        config
            .project_version_deny_list
            .insert("1".to_string(), 2);
        let chain = DispatchCriteria::from_config(&config).unwrap();
        assert_eq!(chain.ramp_up().percent(), 100);
        assert!(chain.proxy_users().snapshot().contains("svc_acct"));
        assert!(chain.project_versions().denies(1, 2));
    }
}
