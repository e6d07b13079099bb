//! PodSynthesizer: compiles one workflow step into a Pod and creates it
//!
//! This is the single entry point of the crate. Each call works on its own
//! copy of the template and holds no state between calls, so one synthesizer
//! per reconciliation pass is enough.
//!
//! ```rust,ignore
//! let outcome = PodSynthesizer::new(&config, &workflow, &collaborators)
//!     .with_create_timeout(Duration::from_secs(30))
//!     .synthesize(PodRequest::new(node_name, main_containers, &template))
//!     .await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{debug, info, instrument};

use heddle_common::error::is_already_exists;
use heddle_common::{
    Error, Result, ANNOTATION_DEFAULT_CONTAINER, ANNOTATION_NODE_ID, ANNOTATION_NODE_NAME,
    LABEL_COMPLETED, LABEL_CONTROLLER_INSTANCE_ID, LABEL_ON_EXIT, LABEL_WORKFLOW,
    WORKFLOW_API_VERSION, WORKFLOW_KIND,
};

use crate::cluster::{
    ArtifactRepository, PodClient, PodIndex, ServiceAccountTokens, TemplateResolver,
};
use crate::config::ControllerConfig;
use crate::constants::INIT_CONTAINER_NAME;
use crate::naming::{node_id, pod_name};
use crate::pipeline::deadline::{self, ActiveDeadline};
use crate::pipeline::{
    archive, containers, patch, scheduling, service_account, substitute, volumes,
};
use crate::rate_limit::RateLimiter;
use crate::types::{NodeStatus, ShutdownStrategy, Template, TemplateType, WorkflowContext};

/// External services the synthesizer depends on
#[derive(Clone)]
pub struct Collaborators {
    pub pod_index: Arc<dyn PodIndex>,
    pub pods: Arc<dyn PodClient>,
    pub service_accounts: Arc<dyn ServiceAccountTokens>,
    pub artifact_repository: Arc<dyn ArtifactRepository>,
    pub templates: Arc<dyn TemplateResolver>,
    /// Shared by every synthesis call in the controller
    pub rate_limiter: Arc<dyn RateLimiter>,
}

/// Per-call options from the step executor
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// Capture the main container's stdout as the step result
    pub include_script_output: bool,
    /// The step belongs to an exit handler
    pub on_exit_pod: bool,
    /// Caller-imposed deadline for the step's execution
    pub execution_deadline: Option<DateTime<Utc>>,
}

/// One step to compile into a pod
#[derive(Clone, Debug)]
pub struct PodRequest<'a> {
    pub node_name: &'a str,
    /// The user's containers, already resolved from the template body
    pub main_containers: Vec<Container>,
    pub template: &'a Template,
    pub options: CreateOptions,
}

impl<'a> PodRequest<'a> {
    pub fn new(
        node_name: &'a str,
        main_containers: Vec<Container>,
        template: &'a Template,
    ) -> Self {
        Self {
            node_name,
            main_containers,
            template,
            options: CreateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CreateOptions) -> Self {
        self.options = options;
        self
    }
}

/// Why no pod was created for a step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The workflow is shutting down and the strategy excludes this step
    Shutdown(ShutdownStrategy),
    /// The workflow deadline passed before the pod could be created
    DeadlineExpired,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Shutdown(strategy) => {
                write!(f, "workflow shutdown with strategy: {}", strategy)
            }
            SkipReason::DeadlineExpired => f.write_str("workflow deadline exceeded"),
        }
    }
}

/// Result of a synthesis call
#[derive(Clone, Debug)]
pub enum SynthesisOutcome {
    /// The step's pod already existed; nothing was created
    Existing(Pod),
    /// A new pod was created
    Created(Pod),
    /// No pod should exist for the step; the caller marks it skipped
    Skipped(SkipReason),
}

impl SynthesisOutcome {
    /// The step's pod, unless the step was skipped
    pub fn pod(&self) -> Option<&Pod> {
        match self {
            SynthesisOutcome::Existing(pod) | SynthesisOutcome::Created(pod) => Some(pod),
            SynthesisOutcome::Skipped(_) => None,
        }
    }

    pub fn into_pod(self) -> Option<Pod> {
        match self {
            SynthesisOutcome::Existing(pod) | SynthesisOutcome::Created(pod) => Some(pod),
            SynthesisOutcome::Skipped(_) => None,
        }
    }
}

/// Compiles workflow steps into pods and creates them at most once
pub struct PodSynthesizer<'a> {
    config: &'a ControllerConfig,
    workflow: &'a WorkflowContext,
    collaborators: &'a Collaborators,
    now: Option<DateTime<Utc>>,
    create_timeout: Option<Duration>,
}

impl<'a> PodSynthesizer<'a> {
    /// Create a synthesizer over one workflow and a configuration snapshot
    pub fn new(
        config: &'a ControllerConfig,
        workflow: &'a WorkflowContext,
        collaborators: &'a Collaborators,
    ) -> Self {
        Self {
            config,
            workflow,
            collaborators,
            now: None,
            create_timeout: None,
        }
    }

    /// Fix the clock used for deadline arithmetic
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Bound the create request; expiry is reported as a transient error
    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = Some(timeout);
        self
    }

    /// Ensure the step's pod exists
    ///
    /// Returns the existing pod when the index already has one, otherwise
    /// builds the pod and creates it. Stages run in order: existence check →
    /// shutdown check → deadline → containers → volumes → scheduling →
    /// substitution → patch → emissary wrapping → template timeout →
    /// rate limit → create.
    #[instrument(
        skip(self, request),
        fields(workflow = %self.workflow.name, node = %request.node_name)
    )]
    pub async fn synthesize(&self, request: PodRequest<'_>) -> Result<SynthesisOutcome> {
        let wf = self.workflow;
        let node_name = request.node_name;
        let options = &request.options;
        let node_id = node_id(&wf.name, node_name);

        // 1. Cheap existence check before any expensive work
        if let Some(existing) = self.existing_pod(&node_id)? {
            debug!(
                node_id = %node_id,
                pod = existing.metadata.name.as_deref().unwrap_or_default(),
                "skipped pod creation: already exists"
            );
            return Ok(SynthesisOutcome::Existing(existing));
        }

        // 2. Shutdown
        if let Some(strategy) = wf.shutdown() {
            if !strategy.should_execute(options.on_exit_pod) {
                info!(strategy = %strategy, "skipped pod creation: workflow shutting down");
                return Ok(SynthesisOutcome::Skipped(SkipReason::Shutdown(strategy)));
            }
        }

        let now = self.now.unwrap_or_else(Utc::now);
        let tmpl = request.template.clone();
        let main_containers =
            containers::prepare_main_containers(&tmpl, request.main_containers, self.config);

        // 3. Deadline
        let active_deadline_seconds = match deadline::resolve(
            wf.deadline,
            tmpl.active_deadline_seconds()?,
            options.on_exit_pod,
            deadline::is_debug_paused(&main_containers),
            now,
        ) {
            ActiveDeadline::Seconds(seconds) => seconds,
            ActiveDeadline::Expired => {
                info!("skipped pod creation: no time left before the active deadline");
                return Ok(SynthesisOutcome::Skipped(SkipReason::DeadlineExpired));
            }
        };

        // 4. Pod skeleton
        let name = pod_name(
            &wf.name,
            node_name,
            &tmpl.name,
            &node_id,
            self.config.pod_name_version,
        );
        let mut meta = self.pod_meta(&name, node_name, &node_id, options.on_exit_pod);
        let spec = self.base_spec(&tmpl, active_deadline_seconds)?;

        // 5. Archive location and service accounts
        let tmpl = archive::add_archive_location(
            tmpl,
            self.collaborators.artifact_repository.as_ref(),
            &wf.spec,
        );
        let mut spec = service_account::setup_service_account(
            spec,
            &tmpl,
            &wf.spec,
            &wf.namespace,
            self.collaborators.service_accounts.as_ref(),
        )
        .await?;

        // 6. Containers: wait first so it observes main from the start
        let executor_account = service_account::executor_service_account(&tmpl, &wf.spec);
        if tmpl.template_type().needs_wait_container() {
            spec.containers.push(containers::wait_container(
                &tmpl,
                self.config,
                &wf.name,
                executor_account,
            ));
        }
        spec.containers.extend(main_containers);
        if let Some(default) = containers::default_container_name(&spec.containers) {
            meta.annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(ANNOTATION_DEFAULT_CONTAINER.to_string(), default.to_string());
        }
        if containers::needs_init_container(&tmpl, self.config) {
            let init = containers::executor_container(
                INIT_CONTAINER_NAME,
                self.config,
                &wf.name,
                executor_account,
            );
            spec = containers::insert_init_container(spec, init);
        }

        // 7. Scheduling, metadata and volumes
        let spec = scheduling::add_scheduling_constraints(spec, &tmpl, &wf.spec);
        let meta = scheduling::add_metadata(meta, &tmpl, &wf.spec);
        let spec = volumes::add_volume_references(
            spec,
            &tmpl,
            &wf.spec.volumes,
            &wf.persistent_volume_claims,
        )?;
        let mut spec = volumes::add_input_artifact_volumes(spec, &tmpl)?;
        if tmpl.template_type() == TemplateType::Script {
            spec = volumes::add_script_staging_volume(spec)?;
        }

        // 8. User containers and output mirroring see main's final mounts
        let spec = containers::add_user_containers(spec, &tmpl);
        let mut spec = volumes::add_output_artifact_volumes(spec, &tmpl);
        if let Some(init_containers) = spec.init_containers.as_mut() {
            containers::mount_var_run(init_containers);
        }

        // 9. Step environment and substitution
        let template_json = serde_json::to_string(&tmpl)
            .map_err(|e| Error::serialization_for_kind("Template", e.to_string()))?;
        let step_env = containers::StepEnv {
            template: &template_json,
            include_script_output: options.include_script_output,
            deadline: deadline::execution_deadline(wf.deadline, options.execution_deadline),
            progress_ticks: self.config.progress_ticks(),
        };
        let spec = containers::add_env_vars(spec, &step_env);

        let params = substitute::pod_params(&wf.global_params, &tmpl, &name);
        let pod = substitute::substitute_pod(
            &Pod {
                metadata: meta,
                spec: Some(spec),
                status: None,
            },
            &params,
        )?;
        let meta = pod.metadata;
        let spec = pod.spec.ok_or_else(|| {
            Error::internal_with_context("substitute", "pod spec lost during substitution")
        })?;
        substitute::verify_archive_location(&spec)?;

        // 10. podSpecPatch
        let spec = match patch::merge_pod_spec_patches(&wf.spec, &tmpl)? {
            Some(merged) => {
                let merged = substitute::replace(&merged, &params, false)?;
                patch::apply_pod_spec_patch(spec, &merged)?
            }
            None => spec,
        };

        // 11. Emissary
        let spec = containers::apply_emissary(spec, self.config, &tmpl.name)?;

        // 12. Template timeout and retry placement
        let node = wf.node_by_name(node_name);
        let template_deadline = deadline::template_deadline(&tmpl, node, node_name, now)?;
        let mut spec = match node {
            Some(node) => self.schedule_on_different_host(spec, node)?,
            None => spec,
        };
        let tightened = deadline::apply_template_deadline(
            spec.active_deadline_seconds,
            template_deadline,
            node_name,
            now,
        )?;
        if tightened != spec.active_deadline_seconds {
            debug!(
                pod = %name,
                active_deadline_seconds = ?tightened,
                "setting activeDeadlineSeconds from template timeout"
            );
            spec.active_deadline_seconds = tightened;
        }

        // 13. Rate limit
        if !self.collaborators.rate_limiter.allow() {
            return Err(Error::RateLimitReached);
        }

        // 14. Create
        let pod = Pod {
            metadata: meta,
            spec: Some(spec),
            status: None,
        };
        self.create(pod, node_name).await
    }

    fn existing_pod(&self, node_id: &str) -> Result<Option<Pod>> {
        let mut pods = self
            .collaborators
            .pod_index
            .pods_for_node(&self.workflow.namespace, node_id)
            .map_err(|e| {
                Error::internal_with_context(
                    "pod-index",
                    format!("failed to get pod from informer store: {}", e),
                )
            })?;
        match pods.len() {
            0 => Ok(None),
            1 => Ok(pods.pop()),
            n => Err(Error::internal_with_context(
                "pod-index",
                format!("expected < 2 pods, got {} - this is a bug", n),
            )),
        }
    }

    fn pod_meta(
        &self,
        name: &str,
        node_name: &str,
        node_id: &str,
        on_exit_pod: bool,
    ) -> ObjectMeta {
        let wf = self.workflow;
        let mut labels = BTreeMap::from([
            (LABEL_WORKFLOW.to_string(), wf.name.clone()),
            (LABEL_COMPLETED.to_string(), "false".to_string()),
        ]);
        if on_exit_pod {
            labels.insert(LABEL_ON_EXIT.to_string(), "true".to_string());
        }
        if let Some(instance_id) = self.config.instance_id() {
            labels.insert(LABEL_CONTROLLER_INSTANCE_ID.to_string(), instance_id.to_string());
        }

        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(wf.namespace.clone()),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([
                (ANNOTATION_NODE_NAME.to_string(), node_name.to_string()),
                (ANNOTATION_NODE_ID.to_string(), node_id.to_string()),
            ])),
            owner_references: Some(vec![OwnerReference {
                api_version: WORKFLOW_API_VERSION.to_string(),
                kind: WORKFLOW_KIND.to_string(),
                name: wf.name.clone(),
                uid: wf.uid.clone(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        }
    }

    fn base_spec(
        &self,
        tmpl: &Template,
        active_deadline_seconds: Option<i64>,
    ) -> Result<PodSpec> {
        let wf = &self.workflow.spec;
        Ok(PodSpec {
            restart_policy: Some("Never".to_string()),
            volumes: Some(volumes::base_volumes(tmpl, self.config)?),
            active_deadline_seconds,
            image_pull_secrets: (!wf.image_pull_secrets.is_empty())
                .then(|| wf.image_pull_secrets.clone()),
            host_network: wf.host_network,
            dns_policy: wf.dns_policy.clone(),
            dns_config: wf.dns_config.clone(),
            share_process_namespace: self
                .config
                .container_runtime_executor
                .shares_process_namespace()
                .then_some(true),
            ..Default::default()
        })
    }

    /// Exclude hosts of failed attempts when the retry strategy asks for it
    fn schedule_on_different_host(&self, spec: PodSpec, node: &NodeStatus) -> Result<PodSpec> {
        let wf = self.workflow;
        let Some(retry_node) = wf.retry_parent(&node.id) else {
            return Ok(spec);
        };
        let retry_tmpl = self.collaborators.templates.resolve(retry_node)?;
        let anti_affinity = retry_tmpl
            .retry_strategy
            .as_ref()
            .or(wf.spec.retry_strategy.as_ref())
            .and_then(|s| s.affinity.as_ref())
            .is_some_and(|a| a.node_anti_affinity.is_some());
        if !anti_affinity {
            return Ok(spec);
        }
        Ok(scheduling::add_retry_anti_affinity(
            spec,
            wf.failed_hosts(retry_node),
        ))
    }

    async fn create(&self, pod: Pod, node_name: &str) -> Result<SynthesisOutcome> {
        let namespace = &self.workflow.namespace;
        let name = pod.metadata.name.clone().unwrap_or_default();
        debug!(pod = %name, "creating pod");

        let attempt = self.collaborators.pods.create(namespace, &pod);
        let result = match self.create_timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(elapsed) => Err(Error::Kube {
                    source: kube::Error::Service(Box::new(elapsed)),
                }),
            },
            None => attempt.await,
        };

        match result {
            Ok(created) => {
                info!(pod = %name, node_name, "created pod");
                Ok(SynthesisOutcome::Created(created))
            }
            // Names are deterministic: an earlier attempt created the pod but
            // its creation was never recorded
            Err(Error::Kube { source }) if is_already_exists(&source) => {
                info!(pod = %name, node_name, "pod creation raced: already exists");
                let existing = self.collaborators.pods.get(namespace, &name).await?;
                Ok(SynthesisOutcome::Existing(existing))
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                info!(pod = %name, node_name, error = %e, "failed to create pod");
                Err(Error::internal_with_context(
                    "create",
                    format!("failed to create pod {}: {}", name, e),
                ))
            }
        }
    }
}
