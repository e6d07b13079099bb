//! Container runtime executor variants
//!
//! Each variant wires the executor into the pod differently. Every piece of
//! variant-specific behavior lives here as a small strategy function so the
//! assembly stages only ever ask the variant what to do.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, HostPathVolumeSource, SecurityContext, Volume, VolumeMount,
};
use serde::{Deserialize, Serialize};

use heddle_common::{Error, Result};

use crate::config::{ControllerConfig, ImageCommand};
use crate::constants::{
    DOCKER_SOCK_PATH, DOCKER_SOCK_PATH_WINDOWS, DOCKER_SOCK_VOLUME_NAME, EMISSARY_BINARY_PATH,
};
use crate::types::Template;

/// How the executor observes and controls the user's containers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorVariant {
    /// Talks to the node's container engine through its socket
    Docker,
    /// Talks to the kubelet API
    Kubelet,
    /// Shares the pod's process namespace with the user's containers
    Pns,
    /// Wraps each user command with a supervising entrypoint
    #[default]
    Emissary,
}

impl ExecutorVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorVariant::Docker => "docker",
            ExecutorVariant::Kubelet => "kubelet",
            ExecutorVariant::Pns => "pns",
            ExecutorVariant::Emissary => "emissary",
        }
    }

    /// PNS needs one process namespace for the whole pod
    pub fn shares_process_namespace(self) -> bool {
        self == ExecutorVariant::Pns
    }

    /// Emissary's init container copies the wrapper binary into the pod
    pub fn requires_init_container(self) -> bool {
        self == ExecutorVariant::Emissary
    }

    /// Emissary runs every non-wait container through its wrapper
    pub fn wraps_commands(self) -> bool {
        self == ExecutorVariant::Emissary
    }

    /// Docker reaches the container engine through a host socket
    pub fn mounts_docker_socket(self) -> bool {
        self == ExecutorVariant::Docker
    }

    /// Kubelet needs the node address and kubelet connection settings
    pub fn talks_to_kubelet(self) -> bool {
        self == ExecutorVariant::Kubelet
    }
}

impl std::fmt::Display for ExecutorVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security context for the wait container under PNS
///
/// The wait container must reach into main's root filesystem, and must be
/// privileged itself to signal a privileged main or sidecar.
pub fn pns_wait_security_context(tmpl: &Template, config: &ControllerConfig) -> SecurityContext {
    let privileged = (tmpl.has_privileged_containers() || config.pns_privileged).then_some(true);
    SecurityContext {
        capabilities: Some(Capabilities {
            add: Some(vec!["SYS_PTRACE".to_string(), "SYS_CHROOT".to_string()]),
            drop: None,
        }),
        privileged,
        ..Default::default()
    }
}

/// Container engine socket path as seen by the wait container
fn docker_sock_path(tmpl: &Template) -> &'static str {
    if tmpl.targets_windows() {
        DOCKER_SOCK_PATH_WINDOWS
    } else {
        DOCKER_SOCK_PATH
    }
}

/// Mount of the container engine socket on the wait container
pub fn docker_sock_mount(tmpl: &Template) -> VolumeMount {
    VolumeMount {
        name: DOCKER_SOCK_VOLUME_NAME.to_string(),
        mount_path: docker_sock_path(tmpl).to_string(),
        read_only: (!tmpl.targets_windows()).then_some(true),
        ..Default::default()
    }
}

/// hostPath volume exposing the node's container engine socket
pub fn docker_sock_volume(tmpl: &Template, config: &ControllerConfig) -> Volume {
    let path = config
        .docker_sock_path
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| docker_sock_path(tmpl));
    Volume {
        name: DOCKER_SOCK_VOLUME_NAME.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: (!tmpl.targets_windows()).then(|| "Socket".to_string()),
        }),
        ..Default::default()
    }
}

/// Prefix a container's command with the emissary wrapper
///
/// Containers without an explicit command take it (and, when unset, their
/// args) from the image index. A container whose command is still unknown
/// cannot be supervised and is rejected.
pub fn wrap_with_emissary(
    mut container: Container,
    images: &BTreeMap<String, ImageCommand>,
    template_name: &str,
) -> Result<Container> {
    let has_command = container.command.as_ref().is_some_and(|c| !c.is_empty());
    if !has_command {
        if let Some(entry) = container.image.as_deref().and_then(|i| images.get(i)) {
            container.command = Some(entry.command.clone());
            if container.args.is_none() {
                container.args = entry.args.clone();
            }
        }
    }

    let command = container
        .command
        .take()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            Error::bad_request(format!(
                "container {:?} in template {:?}, does not have the command specified: when using \
                 the emissary executor you must either explicitly specify the command, or list \
                 the image's command in the index",
                container.name, template_name
            ))
        })?;

    let mut wrapped = vec![
        EMISSARY_BINARY_PATH.to_string(),
        "emissary".to_string(),
        "--".to_string(),
    ];
    wrapped.extend(command);
    container.command = Some(wrapped);
    Ok(container)
}
