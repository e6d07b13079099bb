//! Container assembly
//!
//! Builds the executor containers (init, wait), finalizes the user's main
//! containers, and threads the standard environment through all of them.
//! Executor-variant differences are delegated to [`crate::executor`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, VolumeMount,
};
use tracing::debug;

use heddle_common::Result;

use super::deadline::format_deadline;
use super::volumes::var_run_mount;
use super::{main_container, push_mounts};
use crate::config::{resources_specified, ControllerConfig};
use crate::constants::{
    ENV_CONTAINER_NAME, ENV_CONTAINER_RUNTIME_EXECUTOR, ENV_DEADLINE, ENV_INCLUDE_SCRIPT_OUTPUT,
    ENV_KUBELET_INSECURE, ENV_KUBELET_PORT, ENV_NODE_IP, ENV_POD_NAME,
    ENV_PROGRESS_FILE, ENV_PROGRESS_FILE_TICK_DURATION, ENV_PROGRESS_PATCH_TICK_DURATION,
    ENV_TEMPLATE, ENV_WORKFLOW_NAME, EXECUTOR_BINARY, MAIN_CONTAINER_NAME,
    PROGRESS_FILE_PATH, SA_TOKEN_MOUNT_PATH, SA_TOKEN_VOLUME_NAME, VAR_RUN_VOLUME_NAME,
    WAIT_CONTAINER_NAME,
};
use crate::executor::{docker_sock_mount, pns_wait_security_context, wrap_with_emissary};
use crate::types::{Template, TemplateBody, TemplateType};

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

/// Environment every executor container gets
pub fn executor_env(config: &ControllerConfig, workflow_name: &str) -> Vec<EnvVar> {
    let mut vars = vec![
        field_ref_env(ENV_POD_NAME, "metadata.name"),
        env(
            ENV_CONTAINER_RUNTIME_EXECUTOR,
            config.container_runtime_executor.as_str(),
        ),
        env(ENV_WORKFLOW_NAME, workflow_name),
    ];
    if let Some(executor) = &config.executor {
        vars.extend(executor.env.iter().cloned());
    }
    if config.container_runtime_executor.talks_to_kubelet() {
        vars.push(field_ref_env(ENV_NODE_IP, "status.hostIP"));
        vars.push(env(ENV_KUBELET_PORT, config.kubelet_port.to_string()));
        vars.push(env(ENV_KUBELET_INSECURE, config.kubelet_insecure.to_string()));
    }
    vars
}

/// One executor container running `heddle-exec <role>`
///
/// `executor_service_account` mounts the executor's own API token over the
/// default service account path.
pub fn executor_container(
    role: &str,
    config: &ControllerConfig,
    workflow_name: &str,
    executor_service_account: Option<&str>,
) -> Container {
    let executor = config.executor.as_ref();
    let mut args: Vec<String> = executor.map(|e| e.args.clone()).unwrap_or_default();

    let mut mounts = Vec::new();
    if let Some(kube_config) = &config.kube_config {
        mounts.push(VolumeMount {
            name: kube_config.volume_name().to_string(),
            mount_path: kube_config.mount_path().to_string(),
            sub_path: kube_config.secret_key.clone(),
            ..Default::default()
        });
        args.push(format!("--kubeconfig={}", kube_config.mount_path()));
    }
    if executor_service_account.is_some() {
        mounts.push(VolumeMount {
            name: SA_TOKEN_VOLUME_NAME.to_string(),
            mount_path: SA_TOKEN_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    Container {
        name: role.to_string(),
        image: Some(config.executor_image().to_string()),
        image_pull_policy: config.executor_image_pull_policy().map(str::to_string),
        command: Some(vec![
            EXECUTOR_BINARY.to_string(),
            role.to_string(),
            "--loglevel".to_string(),
            config.executor_log_level.clone(),
        ]),
        args: (!args.is_empty()).then_some(args),
        env: Some(executor_env(config, workflow_name)),
        resources: config.executor_resources().cloned(),
        security_context: executor.and_then(|e| e.security_context.clone()),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    }
}

/// The wait container, wired for the configured executor
pub fn wait_container(
    tmpl: &Template,
    config: &ControllerConfig,
    workflow_name: &str,
    executor_service_account: Option<&str>,
) -> Container {
    let mut wait = executor_container(
        WAIT_CONTAINER_NAME,
        config,
        workflow_name,
        executor_service_account,
    );
    let variant = config.container_runtime_executor;
    if variant.shares_process_namespace() {
        wait.security_context = Some(pns_wait_security_context(tmpl, config));
    }
    if variant.mounts_docker_socket() {
        push_mounts(&mut wait, [docker_sock_mount(tmpl)]);
    }
    wait
}

/// Whether anything must be staged before main starts
pub fn needs_init_container(tmpl: &Template, config: &ControllerConfig) -> bool {
    !tmpl.inputs.artifacts.is_empty()
        || tmpl.template_type() == TemplateType::Script
        || config.container_runtime_executor.requires_init_container()
}

/// Name and resource the user's main containers
///
/// Outside a container set every main container is named `main`. Resources
/// start from the controller default. Resources declared on a script, or on
/// a container template whose container is explicitly named `main`, override
/// that default.
pub fn prepare_main_containers(
    tmpl: &Template,
    main_containers: Vec<Container>,
    config: &ControllerConfig,
) -> Vec<Container> {
    let container_set = tmpl.template_type() == TemplateType::ContainerSet;
    let declared = match &tmpl.body {
        TemplateBody::Container(c) if c.name == MAIN_CONTAINER_NAME => c.resources.as_ref(),
        TemplateBody::Script(s) => s.container.resources.as_ref(),
        _ => None,
    }
    .filter(|r| resources_specified(r));

    main_containers
        .into_iter()
        .map(|mut c| {
            if c.name.is_empty() || !container_set {
                c.name = MAIN_CONTAINER_NAME.to_string();
            }
            if let Some(resources) = config.main_container_resources() {
                c.resources = Some(resources.clone());
            }
            if let Some(resources) = declared {
                c.resources = Some(resources.clone());
            }
            c
        })
        .collect()
}

/// Container `kubectl` should default to: `main`, else the last one
pub fn default_container_name(containers: &[Container]) -> Option<&str> {
    main_container(containers)
        .or_else(|| containers.last())
        .map(|c| c.name.as_str())
}

/// Append the template's init containers and sidecars
///
/// Containers with `mirrorVolumeMounts` get a copy of main's mounts.
pub fn add_user_containers(mut spec: PodSpec, tmpl: &Template) -> PodSpec {
    let main_mounts: Vec<VolumeMount> = main_container(&spec.containers)
        .and_then(|c| c.volume_mounts.clone())
        .unwrap_or_default();

    let mirror = |uc: &crate::types::UserContainer| {
        let mut container = uc.container.clone();
        if uc.mirrors_volume_mounts() {
            push_mounts(&mut container, main_mounts.iter().cloned());
        }
        container
    };

    if !tmpl.init_containers.is_empty() {
        spec.init_containers
            .get_or_insert_with(Vec::new)
            .extend(tmpl.init_containers.iter().map(mirror));
    }
    spec.containers.extend(tmpl.sidecars.iter().map(mirror));
    spec
}

/// Mount the executor scratch volume on every container lacking it
pub fn mount_var_run(containers: &mut [Container]) {
    for container in containers {
        let mounted = container
            .volume_mounts
            .iter()
            .flatten()
            .any(|m| m.name == VAR_RUN_VOLUME_NAME);
        if !mounted {
            push_mounts(container, [var_run_mount()]);
        }
    }
}

/// Wrap every non-wait container's command with the emissary entrypoint
pub fn apply_emissary(
    mut spec: PodSpec,
    config: &ControllerConfig,
    template_name: &str,
) -> Result<PodSpec> {
    if config.container_runtime_executor.wraps_commands() {
        spec.containers = spec
            .containers
            .into_iter()
            .map(|c| {
                if c.name == WAIT_CONTAINER_NAME {
                    Ok(c)
                } else {
                    wrap_with_emissary(c, &config.images, template_name)
                }
            })
            .collect::<Result<_>>()?;
    }
    mount_var_run(&mut spec.containers);
    Ok(spec)
}

/// Values of the environment shared by every container of a step
#[derive(Clone, Debug)]
pub struct StepEnv<'a> {
    /// JSON form of the template the executor runs
    pub template: &'a str,
    pub include_script_output: bool,
    pub deadline: Option<DateTime<Utc>>,
    pub progress_ticks: Option<(Duration, Duration)>,
}

impl StepEnv<'_> {
    fn vars(&self, container_name: &str) -> Vec<EnvVar> {
        let mut vars = vec![
            env(ENV_CONTAINER_NAME, container_name),
            env(ENV_TEMPLATE, self.template),
            env(
                ENV_INCLUDE_SCRIPT_OUTPUT,
                self.include_script_output.to_string(),
            ),
            env(ENV_DEADLINE, format_deadline(self.deadline)),
            env(ENV_PROGRESS_FILE, PROGRESS_FILE_PATH),
        ];
        if let Some((patch, file)) = self.progress_ticks {
            vars.push(env(
                ENV_PROGRESS_PATCH_TICK_DURATION,
                humantime::format_duration(patch).to_string(),
            ));
            vars.push(env(
                ENV_PROGRESS_FILE_TICK_DURATION,
                humantime::format_duration(file).to_string(),
            ));
        }
        vars
    }
}

/// Append the step environment to every container and init container
pub fn add_env_vars(mut spec: PodSpec, step_env: &StepEnv<'_>) -> PodSpec {
    let containers = spec
        .init_containers
        .iter_mut()
        .flatten()
        .chain(spec.containers.iter_mut());
    for container in containers {
        let vars = step_env.vars(&container.name);
        container.env.get_or_insert_with(Vec::new).extend(vars);
    }
    debug!(
        include_script_output = step_env.include_script_output,
        "added step environment to containers"
    );
    spec
}

/// Place the executor's init container ahead of any user init containers
pub fn insert_init_container(mut spec: PodSpec, init: Container) -> PodSpec {
    spec.init_containers.get_or_insert_with(Vec::new).insert(0, init);
    spec
}
