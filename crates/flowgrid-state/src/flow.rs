//! Flow DAG nodes and the traversals the dispatch engine needs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A node of a flow DAG: a leaf job or an embedded sub-flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowNode {
    Job {
        id: String,
        job_type: String,
        #[serde(default)]
        disabled: bool,
        #[serde(default)]
        proxy_user: Option<String>,
    },
    Subflow {
        id: String,
        #[serde(default)]
        disabled: bool,
        #[serde(default)]
        proxy_user: Option<String>,
        nodes: Vec<FlowNode>,
    },
}

impl FlowNode {
    pub fn job(id: &str, job_type: &str) -> Self {
        FlowNode::Job {
            id: id.to_string(),
            job_type: job_type.to_string(),
            disabled: false,
            proxy_user: None,
        }
    }

    pub fn subflow(id: &str, nodes: Vec<FlowNode>) -> Self {
        FlowNode::Subflow {
            id: id.to_string(),
            disabled: false,
            proxy_user: None,
            nodes,
        }
    }

    pub fn disabled(mut self) -> Self {
        match &mut self {
            FlowNode::Job { disabled, .. } | FlowNode::Subflow { disabled, .. } => *disabled = true,
        }
        self
    }

    pub fn run_as(mut self, user: &str) -> Self {
        match &mut self {
            FlowNode::Job { proxy_user, .. } | FlowNode::Subflow { proxy_user, .. } => {
                *proxy_user = Some(user.to_string())
            }
        }
        self
    }

    pub fn id(&self) -> &str {
        match self {
            FlowNode::Job { id, .. } | FlowNode::Subflow { id, .. } => id,
        }
    }

    pub fn is_disabled(&self) -> bool {
        match self {
            FlowNode::Job { disabled, .. } | FlowNode::Subflow { disabled, .. } => *disabled,
        }
    }

    fn proxy_user(&self) -> Option<&str> {
        match self {
            FlowNode::Job { proxy_user, .. } | FlowNode::Subflow { proxy_user, .. } => {
                proxy_user.as_deref()
            }
        }
    }
}

/// Depth-first walk collecting job types. Disabled nodes, and everything
/// under a disabled sub-flow, are skipped.
pub fn collect_job_types(nodes: &[FlowNode]) -> BTreeSet<String> {
    let mut types = BTreeSet::new();
    let mut stack: Vec<&FlowNode> = nodes.iter().rev().collect();
    while let Some(node) = stack.pop() {
        if node.is_disabled() {
            continue;
        }
        match node {
            FlowNode::Job { job_type, .. } => {
                types.insert(job_type.clone());
            }
            FlowNode::Subflow { nodes, .. } => stack.extend(nodes.iter().rev()),
        }
    }
    types
}

/// Depth-first walk collecting the effective proxy user of every enabled
/// job. A node's own proxy user overrides the one inherited from its
/// enclosing sub-flow or the flow itself.
pub fn collect_proxy_users(nodes: &[FlowNode], inherited: Option<&str>) -> BTreeSet<String> {
    let mut users = BTreeSet::new();
    let mut stack: Vec<(&FlowNode, Option<&str>)> =
        nodes.iter().rev().map(|n| (n, inherited)).collect();
    while let Some((node, inherited)) = stack.pop() {
        if node.is_disabled() {
            continue;
        }
        let effective = node.proxy_user().or(inherited);
        match node {
            FlowNode::Job { .. } => {
                if let Some(user) = effective {
                    users.insert(user.to_string());
                }
            }
            FlowNode::Subflow { nodes, .. } => {
                stack.extend(nodes.iter().rev().map(|n| (n, effective)));
            }
        }
    }
    users
}
