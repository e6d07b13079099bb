//! Step templates
//!
//! A `Template` is the already-resolved definition of one workflow step. The
//! kind of work it performs is a closed set ([`TemplateBody`]), so every stage of
//! synthesis matches on it exhaustively.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, HostAlias, PodSecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

use heddle_common::{Error, Result};

use super::artifact::{Artifact, ArtifactLocation};

/// What kind of work a template performs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateType {
    Container,
    ContainerSet,
    Script,
    Resource,
    Data,
}

impl TemplateType {
    /// Resource and data templates run the executor as their only container
    pub fn needs_wait_container(self) -> bool {
        !matches!(self, TemplateType::Resource | TemplateType::Data)
    }

    /// Whether user volume mounts of this template must resolve to pod volumes
    pub fn mounts_user_volumes(self) -> bool {
        match self {
            TemplateType::Container
            | TemplateType::ContainerSet
            | TemplateType::Script
            | TemplateType::Data => true,
            TemplateType::Resource => false,
        }
    }
}

impl std::fmt::Display for TemplateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TemplateType::Container => "Container",
            TemplateType::ContainerSet => "ContainerSet",
            TemplateType::Script => "Script",
            TemplateType::Resource => "Resource",
            TemplateType::Data => "Data",
        };
        write!(f, "{}", s)
    }
}

/// Script template: a container plus the source it runs
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTemplate {
    #[serde(flatten)]
    pub container: Container,
    #[serde(default)]
    pub source: String,
}

/// One container of a container set
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerNode {
    #[serde(flatten)]
    pub container: Container,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// Several user containers in one pod
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSetTemplate {
    #[serde(default)]
    pub containers: Vec<ContainerNode>,
    /// Mounts shared by every container of the set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Manipulates a Kubernetes resource from the executor
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_owner_reference: Option<bool>,
}

/// Source of a data template
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    /// Artifact whose paths are listed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_paths: Option<Artifact>,
}

/// Transforms data from a source inside the executor
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTemplate {
    #[serde(default)]
    pub source: DataSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformation: Vec<serde_json::Value>,
}

/// The work a template performs, exactly one of the supported kinds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TemplateBody {
    Container(Container),
    Script(ScriptTemplate),
    ContainerSet(ContainerSetTemplate),
    Resource(ResourceTemplate),
    Data(DataTemplate),
}

impl Default for TemplateBody {
    fn default() -> Self {
        TemplateBody::Container(Container::default())
    }
}

/// A named template parameter
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Parameter {
    /// Create a parameter with a value
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inputs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outputs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

/// Labels and annotations applied to the pod
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// User-declared init container or sidecar
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContainer {
    #[serde(flatten)]
    pub container: Container,
    /// Copy the main container's volume mounts onto this container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_volume_mounts: Option<bool>,
}

impl UserContainer {
    pub fn mirrors_volume_mounts(&self) -> bool {
        self.mirror_volume_mounts.unwrap_or(false)
    }
}

/// Executor overrides
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Marker requesting that retries avoid hosts of failed attempts
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryNodeAntiAffinity {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAffinity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_anti_affinity: Option<RetryNodeAntiAffinity>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<RetryAffinity>,
}

/// The resolved definition of one workflow step
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,

    #[serde(flatten)]
    pub body: TemplateBody,

    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<UserContainer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<UserContainer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_location: Option<ArtifactLocation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<IntOrString>,
    /// Wall-clock budget counted from the node's start, e.g. "10m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_aliases: Vec<HostAlias>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorConfig>,

    #[serde(default)]
    pub metadata: Metadata,
    /// Strategic-merge patch (JSON or YAML) applied to the pod spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_spec_patch: Option<String>,
}

impl Template {
    /// Create a container template
    pub fn container(name: impl Into<String>, container: Container) -> Self {
        Self {
            name: name.into(),
            body: TemplateBody::Container(container),
            ..Default::default()
        }
    }

    /// Create a template with the given body
    pub fn with_body(name: impl Into<String>, body: TemplateBody) -> Self {
        Self {
            name: name.into(),
            body,
            ..Default::default()
        }
    }

    pub fn template_type(&self) -> TemplateType {
        match &self.body {
            TemplateBody::Container(_) => TemplateType::Container,
            TemplateBody::Script(_) => TemplateType::Script,
            TemplateBody::ContainerSet(_) => TemplateType::ContainerSet,
            TemplateBody::Resource(_) => TemplateType::Resource,
            TemplateBody::Data(_) => TemplateType::Data,
        }
    }

    /// Volume mounts the user declared for the template's main work
    pub fn volume_mounts(&self) -> &[VolumeMount] {
        let mounts = match &self.body {
            TemplateBody::Container(c) => c.volume_mounts.as_deref(),
            TemplateBody::Script(s) => s.container.volume_mounts.as_deref(),
            TemplateBody::ContainerSet(set) => Some(set.volume_mounts.as_slice()),
            TemplateBody::Resource(_) | TemplateBody::Data(_) => None,
        };
        mounts.unwrap_or_default()
    }

    /// Deepest user mount whose path contains `path` (equal or parent directory)
    pub fn overlapping_volume_mount(&self, path: &str) -> Option<&VolumeMount> {
        let path = path.trim_end_matches('/');
        self.volume_mounts()
            .iter()
            .filter(|mnt| {
                let mount_path = mnt.mount_path.trim_end_matches('/');
                path == mount_path
                    || path
                        .strip_prefix(mount_path)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|mnt| mnt.mount_path.trim_end_matches('/').len())
    }

    /// Template-level deadline in seconds, if any
    pub fn active_deadline_seconds(&self) -> Result<Option<i64>> {
        match &self.active_deadline_seconds {
            None => Ok(None),
            Some(IntOrString::Int(v)) => Ok(Some(i64::from(*v))),
            Some(IntOrString::String(s)) => s.trim().parse::<i64>().map(Some).map_err(|e| {
                Error::bad_request_for_field(
                    "activeDeadlineSeconds",
                    format!("invalid activeDeadlineSeconds {:?}: {}", s, e),
                )
            }),
        }
    }

    /// Whether a template-level pod spec patch is set
    pub fn has_pod_spec_patch(&self) -> bool {
        self.pod_spec_patch.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Whether the template's containers run on Windows nodes
    pub fn targets_windows(&self) -> bool {
        self.node_selector
            .get(crate::constants::NODE_OS_LABEL)
            .is_some_and(|os| os == "windows")
    }

    /// Whether the main container or any sidecar requests privileged mode
    pub fn has_privileged_containers(&self) -> bool {
        let main = match &self.body {
            TemplateBody::Container(c) => Some(c),
            TemplateBody::Script(s) => Some(&s.container),
            _ => None,
        };
        main.into_iter()
            .chain(self.sidecars.iter().map(|s| &s.container))
            .any(is_privileged)
    }

    /// Artifact a data template reads from, if any
    pub fn data_source_artifact(&self) -> Option<&Artifact> {
        match &self.body {
            TemplateBody::Data(data) => data.source.artifact_paths.as_ref(),
            _ => None,
        }
    }
}

fn is_privileged(container: &Container) -> bool {
    container
        .security_context
        .as_ref()
        .and_then(|sc| sc.privileged)
        .unwrap_or(false)
}
