//! Workflow-level state read during synthesis

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, HostAlias, LocalObjectReference, PodDNSConfig, PodSecurityContext, Toleration,
    Volume,
};
use serde::{Deserialize, Serialize};

use super::template::{ExecutorConfig, Metadata, RetryStrategy};

/// How a workflow is being shut down
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownStrategy {
    /// Stop everything, exit handlers included
    Terminate,
    /// Stop regular steps but still run exit handlers
    Stop,
}

impl ShutdownStrategy {
    /// Whether a pod may still be scheduled under this strategy
    pub fn should_execute(self, on_exit_pod: bool) -> bool {
        match self {
            ShutdownStrategy::Terminate => false,
            ShutdownStrategy::Stop => on_exit_pod,
        }
    }
}

impl std::fmt::Display for ShutdownStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownStrategy::Terminate => write!(f, "Terminate"),
            ShutdownStrategy::Stop => write!(f, "Stop"),
        }
    }
}

/// Workflow spec fields that shape step pods
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_priority_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_aliases: Vec<HostAlias>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_config: Option<PodDNSConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_metadata: Option<Metadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_logs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    /// Workflow-level pod spec patch, merged under the template's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_spec_patch: Option<String>,
    /// Volumes that any step may mount by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownStrategy>,
}

impl WorkflowSpec {
    pub fn has_pod_spec_patch(&self) -> bool {
        self.pod_spec_patch.as_deref().is_some_and(|p| !p.is_empty())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    Pod,
    Steps,
    #[serde(rename = "DAG")]
    Dag,
    Retry,
    Skipped,
    Suspend,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Skipped,
    Failed,
    Error,
    Omitted,
}

impl NodePhase {
    pub fn is_failure(self) -> bool {
        matches!(self, NodePhase::Failed | NodePhase::Error)
    }
}

/// Status of one node of the workflow graph
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub phase: NodePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    /// Scope the template name is resolved in, e.g. "local/my-wf"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Kubernetes node the pod ran on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

/// The per-workflow state a synthesis call is evaluated against
///
/// Built by the caller from the Workflow resource; treated as immutable for
/// the duration of a call.
#[derive(Clone, Debug, Default)]
pub struct WorkflowContext {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub spec: WorkflowSpec,
    /// Absolute workflow deadline, if one is configured
    pub deadline: Option<DateTime<Utc>>,
    /// Resolved global parameters (`workflow.name`, `workflow.parameters.x`, ...)
    pub global_params: BTreeMap<String, String>,
    /// Volumes generated from the workflow's volume claim templates
    pub persistent_volume_claims: Vec<Volume>,
    /// Node statuses keyed by node ID
    pub nodes: BTreeMap<String, NodeStatus>,
}

impl WorkflowContext {
    /// Create a context with no nodes, parameters or deadline
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
            ..Default::default()
        }
    }

    /// Look up a node's status by node name
    pub fn node_by_name(&self, node_name: &str) -> Option<&NodeStatus> {
        self.nodes.values().find(|n| n.name == node_name)
    }

    /// The retry node that owns `node_id` as a direct child, if any
    pub fn retry_parent(&self, node_id: &str) -> Option<&NodeStatus> {
        self.nodes
            .values()
            .find(|n| n.node_type == NodeType::Retry && n.children.iter().any(|c| c == node_id))
    }

    /// Hosts on which earlier attempts of a retry node failed, deduplicated
    pub fn failed_hosts(&self, retry_node: &NodeStatus) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for child in retry_node.children.iter().filter_map(|id| self.nodes.get(id)) {
            if child.node_type != NodeType::Pod || !child.phase.is_failure() {
                continue;
            }
            if let Some(host) = child.host_node_name.as_deref().filter(|h| !h.is_empty()) {
                if !hosts.iter().any(|h| h == host) {
                    hosts.push(host.to_string());
                }
            }
        }
        hosts
    }

    /// Shutdown strategy in effect, if the workflow is shutting down
    pub fn shutdown(&self) -> Option<ShutdownStrategy> {
        self.spec.shutdown
    }
}
