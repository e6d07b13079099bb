//! Controller configuration snapshot
//!
//! Read from the controller ConfigMap and passed explicitly into every
//! synthesis call. Nothing in this crate reads configuration from ambient
//! global state.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, SecurityContext};
use serde::{Deserialize, Deserializer};

use heddle_common::yaml::parse_yaml;
use heddle_common::{Error, Result};

use crate::constants::{KUBECONFIG_DEFAULT_MOUNT_PATH, KUBECONFIG_DEFAULT_VOLUME_NAME};
use crate::executor::ExecutorVariant;
use crate::naming::PodNameVersion;
use crate::types::ArtifactLocation;

/// Executor image used when none is configured
pub const DEFAULT_EXECUTOR_IMAGE: &str = "quay.io/heddle/heddle-exec:latest";

/// Default kubelet port for the kubelet executor
pub const DEFAULT_KUBELET_PORT: u16 = 10250;

/// Settings for the executor containers (init and wait)
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorSettings {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub security_context: Option<SecurityContext>,
}

/// Defaults applied to every main container
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainContainerSettings {
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

/// Kubeconfig mounted into executor containers
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfigSettings {
    pub secret_name: String,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub volume_name: Option<String>,
    #[serde(default)]
    pub mount_path: Option<String>,
}

impl KubeConfigSettings {
    pub fn volume_name(&self) -> &str {
        self.volume_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(KUBECONFIG_DEFAULT_VOLUME_NAME)
    }

    pub fn mount_path(&self) -> &str {
        self.mount_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(KUBECONFIG_DEFAULT_MOUNT_PATH)
    }
}

/// Entrypoint of an image, for containers that do not set a command
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageCommand {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

/// The default artifact repository
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRepositorySettings {
    #[serde(default)]
    pub archive_logs: bool,
    #[serde(flatten)]
    pub location: ArtifactLocation,
}

/// Immutable controller-wide configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    #[serde(default)]
    pub executor: Option<ExecutorSettings>,
    #[serde(default)]
    pub main_container: Option<MainContainerSettings>,
    /// Legacy executor resources, used when `executor.resources` is unset
    #[serde(default)]
    pub executor_resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub kube_config: Option<KubeConfigSettings>,
    #[serde(default)]
    pub docker_sock_path: Option<String>,
    #[serde(default)]
    pub container_runtime_executor: ExecutorVariant,
    #[serde(default = "default_kubelet_port")]
    pub kubelet_port: u16,
    #[serde(default)]
    pub kubelet_insecure: bool,
    #[serde(default, rename = "instanceID")]
    pub instance_id: Option<String>,
    /// Image reference to entrypoint, consulted by the emissary executor
    #[serde(default)]
    pub images: BTreeMap<String, ImageCommand>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub progress_patch_tick_duration: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub progress_file_tick_duration: Option<Duration>,
    /// Always run the PNS wait container privileged
    #[serde(default)]
    pub pns_privileged: bool,
    #[serde(default = "default_log_level")]
    pub executor_log_level: String,
    #[serde(default)]
    pub pod_name_version: PodNameVersion,
    #[serde(default)]
    pub artifact_repository: Option<ArtifactRepositorySettings>,
}

fn default_kubelet_port() -> u16 {
    DEFAULT_KUBELET_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => humantime::parse_duration(s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            executor: None,
            main_container: None,
            executor_resources: None,
            kube_config: None,
            docker_sock_path: None,
            container_runtime_executor: ExecutorVariant::default(),
            kubelet_port: DEFAULT_KUBELET_PORT,
            kubelet_insecure: false,
            instance_id: None,
            images: BTreeMap::new(),
            progress_patch_tick_duration: None,
            progress_file_tick_duration: None,
            pns_privileged: false,
            executor_log_level: default_log_level(),
            pod_name_version: PodNameVersion::default(),
            artifact_repository: None,
        }
    }
}

impl ControllerConfig {
    /// Parse the controller ConfigMap's `config` entry (YAML or JSON)
    pub fn from_yaml(input: &str) -> Result<Self> {
        let value = parse_yaml(input, "controller config")
            .map_err(|e| Error::serialization_for_kind("ControllerConfig", e.to_string()))?;
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind("ControllerConfig", e.to_string()))
    }

    pub fn executor_image(&self) -> &str {
        self.executor
            .as_ref()
            .and_then(|e| e.image.as_deref())
            .filter(|i| !i.is_empty())
            .unwrap_or(DEFAULT_EXECUTOR_IMAGE)
    }

    pub fn executor_image_pull_policy(&self) -> Option<&str> {
        self.executor
            .as_ref()
            .and_then(|e| e.image_pull_policy.as_deref())
            .filter(|p| !p.is_empty())
    }

    /// Executor resources: `executor.resources`, else the legacy field
    pub fn executor_resources(&self) -> Option<&ResourceRequirements> {
        self.executor
            .as_ref()
            .and_then(|e| e.resources.as_ref())
            .filter(|r| resources_specified(r))
            .or(self.executor_resources.as_ref())
    }

    /// Controller-wide default resources for main containers
    pub fn main_container_resources(&self) -> Option<&ResourceRequirements> {
        self.main_container
            .as_ref()
            .and_then(|m| m.resources.as_ref())
            .filter(|r| resources_specified(r))
    }

    /// Both tick durations, only when both are configured non-zero
    pub fn progress_ticks(&self) -> Option<(Duration, Duration)> {
        match (self.progress_patch_tick_duration, self.progress_file_tick_duration) {
            (Some(patch), Some(file)) if !patch.is_zero() && !file.is_zero() => {
                Some((patch, file))
            }
            _ => None,
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Whether any resource limit or request is set
pub fn resources_specified(resources: &ResourceRequirements) -> bool {
    resources.limits.as_ref().is_some_and(|l| !l.is_empty())
        || resources.requests.as_ref().is_some_and(|r| !r.is_empty())
}
