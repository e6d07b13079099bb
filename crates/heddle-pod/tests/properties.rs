//! Cross-stage properties of synthesized pods
//!
//! These drive the public entry point against in-memory collaborators, so
//! they check what the whole pipeline produces rather than any single stage.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, Pod, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use parking_lot::Mutex;

use heddle_common::{Error, Result, ANNOTATION_NODE_ID, LABEL_WORKFLOW};
use heddle_pod::constants::{
    INIT_CONTAINER_NAME, INPUT_ARTIFACTS_VOLUME_NAME, MAIN_CONTAINER_NAME, WAIT_CONTAINER_NAME,
};
use heddle_pod::types::{
    Artifact, ArtifactLocation, DataSource, DataTemplate, NodeStatus, ResourceTemplate,
    S3Artifact, SecretKeySelector, Template, TemplateBody, WorkflowContext,
};
use heddle_pod::{
    ArtifactRepository, Collaborators, ControllerConfig, ExecutorVariant, PodClient, PodIndex,
    PodRequest, PodSynthesizer, RateLimiter, ServiceAccountTokens, SkipReason, SynthesisOutcome,
    TemplateResolver, Unlimited,
};

// =============================================================================
// In-memory collaborators
// =============================================================================

/// A cluster whose pod index sees every pod the moment it is created
#[derive(Default)]
struct FakeCluster {
    pods: Mutex<Vec<Pod>>,
    creates: Mutex<usize>,
}

impl FakeCluster {
    fn create_calls(&self) -> usize {
        *self.creates.lock()
    }
}

impl PodIndex for FakeCluster {
    fn pods_for_node(&self, namespace: &str, node_id: &str) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .iter()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .filter(|p| {
                p.metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_NODE_ID))
                    .is_some_and(|id| id == node_id)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PodClient for FakeCluster {
    async fn create(&self, _namespace: &str, pod: &Pod) -> Result<Pod> {
        *self.creates.lock() += 1;
        self.pods.lock().push(pod.clone());
        Ok(pod.clone())
    }

    async fn get(&self, _namespace: &str, name: &str) -> Result<Pod> {
        self.pods
            .lock()
            .iter()
            .find(|p| p.metadata.name.as_deref() == Some(name))
            .cloned()
            .ok_or_else(|| Error::internal(format!("pod {} not found", name)))
    }
}

struct FakeTokens;

#[async_trait]
impl ServiceAccountTokens for FakeTokens {
    async fn token_secret_name(&self, _namespace: &str, service_account: &str) -> Result<String> {
        Ok(format!("{}-token-abcde", service_account))
    }
}

struct FakeRepository;

impl ArtifactRepository for FakeRepository {
    fn to_location(&self) -> ArtifactLocation {
        s3_location("artifacts", "{{workflow.name}}/{{pod.name}}")
    }

    fn is_archive_logs(&self) -> bool {
        false
    }
}

struct NoTemplates;

impl TemplateResolver for NoTemplates {
    fn resolve(&self, node: &NodeStatus) -> Result<Template> {
        Err(Error::bad_request(format!("no template for {}", node.name)))
    }
}

struct DenyAll;

impl RateLimiter for DenyAll {
    fn allow(&self) -> bool {
        false
    }
}

fn collaborators(cluster: &Arc<FakeCluster>) -> Collaborators {
    Collaborators {
        pod_index: cluster.clone(),
        pods: cluster.clone(),
        service_accounts: Arc::new(FakeTokens),
        artifact_repository: Arc::new(FakeRepository),
        templates: Arc::new(NoTemplates),
        rate_limiter: Arc::new(Unlimited),
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn workflow() -> WorkflowContext {
    let mut wf = WorkflowContext::new("wf", "argo", "uid-1");
    wf.global_params.insert("workflow.name".into(), "wf".into());
    wf
}

fn main_container() -> Container {
    Container {
        name: MAIN_CONTAINER_NAME.to_string(),
        image: Some("alpine".to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec!["echo hi".to_string()]),
        ..Default::default()
    }
}

fn s3_location(bucket: &str, key: &str) -> ArtifactLocation {
    ArtifactLocation {
        s3: Some(S3Artifact {
            bucket: Some(bucket.into()),
            key: Some(key.into()),
            access_key_secret: Some(SecretKeySelector::new("s3-creds", "accesskey")),
            secret_key_secret: Some(SecretKeySelector::new("s3-creds", "secretkey")),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn input_artifact(name: &str, path: &str) -> Artifact {
    Artifact {
        location: s3_location("in", &format!("inputs/{}", name)),
        ..Artifact::new(name, path)
    }
}

async fn synthesize(
    config: &ControllerConfig,
    wf: &WorkflowContext,
    collaborators: &Collaborators,
    tmpl: &Template,
    main: Container,
) -> Result<SynthesisOutcome> {
    PodSynthesizer::new(config, wf, collaborators)
        .with_now(now())
        .synthesize(PodRequest::new("wf[0].step", vec![main], tmpl))
        .await
}

fn created(outcome: SynthesisOutcome) -> Pod {
    match outcome {
        SynthesisOutcome::Created(pod) => pod,
        other => panic!("Expected Created variant, got {:?}", other),
    }
}

fn container_names(containers: &[Container]) -> Vec<&str> {
    containers.iter().map(|c| c.name.as_str()).collect()
}

// =============================================================================
// Container layout
// =============================================================================

#[tokio::test]
async fn resource_and_data_templates_have_no_wait_container() {
    let bodies = [
        TemplateBody::Resource(ResourceTemplate {
            action: "create".into(),
            manifest: Some("kind: ConfigMap".into()),
            ..Default::default()
        }),
        TemplateBody::Data(DataTemplate {
            source: DataSource {
                artifact_paths: Some(input_artifact("listing", "/data")),
            },
            ..Default::default()
        }),
    ];
    for body in bodies {
        let cluster = Arc::new(FakeCluster::default());
        let tmpl = Template::with_body("t", body);
        let pod = created(
            synthesize(
                &ControllerConfig::default(),
                &workflow(),
                &collaborators(&cluster),
                &tmpl,
                main_container(),
            )
            .await
            .unwrap(),
        );
        let spec = pod.spec.unwrap();
        assert!(!container_names(&spec.containers).contains(&WAIT_CONTAINER_NAME));
    }
}

#[tokio::test]
async fn input_artifacts_bring_init_container_and_shared_volume() {
    let cluster = Arc::new(FakeCluster::default());
    let config = ControllerConfig {
        container_runtime_executor: ExecutorVariant::Pns,
        ..Default::default()
    };
    let mut tmpl = Template::container("t", main_container());
    tmpl.inputs.artifacts = vec![input_artifact("code", "/src")];

    let pod = created(
        synthesize(&config, &workflow(), &collaborators(&cluster), &tmpl, main_container())
            .await
            .unwrap(),
    );
    let spec = pod.spec.unwrap();
    let init_containers = spec.init_containers.unwrap();
    assert_eq!(init_containers[0].name, INIT_CONTAINER_NAME);
    assert!(init_containers[0]
        .volume_mounts
        .iter()
        .flatten()
        .any(|m| m.name == INPUT_ARTIFACTS_VOLUME_NAME));
    assert!(spec
        .volumes
        .unwrap()
        .iter()
        .any(|v| v.name == INPUT_ARTIFACTS_VOLUME_NAME));
}

#[tokio::test]
async fn pns_shares_process_namespace_with_wait_first() {
    let cluster = Arc::new(FakeCluster::default());
    let config = ControllerConfig {
        container_runtime_executor: ExecutorVariant::Pns,
        ..Default::default()
    };
    let mut tmpl = Template::container("t", main_container());
    tmpl.sidecars = vec![heddle_pod::types::UserContainer {
        container: Container {
            name: "proxy".into(),
            image: Some("envoy".into()),
            ..Default::default()
        },
        mirror_volume_mounts: None,
    }];

    let pod = created(
        synthesize(&config, &workflow(), &collaborators(&cluster), &tmpl, main_container())
            .await
            .unwrap(),
    );
    let spec = pod.spec.unwrap();
    assert_eq!(spec.share_process_namespace, Some(true));
    let names = container_names(&spec.containers);
    let wait = names.iter().position(|n| *n == WAIT_CONTAINER_NAME).unwrap();
    let main = names.iter().position(|n| *n == MAIN_CONTAINER_NAME).unwrap();
    assert!(wait < main);
}

// =============================================================================
// Volumes and secrets
// =============================================================================

#[tokio::test]
async fn volume_names_are_unique() {
    let cluster = Arc::new(FakeCluster::default());
    let data = Volume {
        name: "data".into(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };
    let mut wf = workflow();
    wf.spec.volumes = vec![data.clone()];

    let mut main = main_container();
    main.volume_mounts = Some(vec![
        VolumeMount {
            name: "data".into(),
            mount_path: "/data".into(),
            ..Default::default()
        },
        VolumeMount {
            name: "data".into(),
            mount_path: "/data-again".into(),
            ..Default::default()
        },
    ]);
    let mut tmpl = Template::with_body(
        "t",
        TemplateBody::Script(heddle_pod::types::ScriptTemplate {
            container: main.clone(),
            source: "echo hi".into(),
        }),
    );
    tmpl.volumes = vec![data];
    tmpl.inputs.artifacts = vec![input_artifact("a", "/in/a"), input_artifact("b", "/in/b")];
    tmpl.outputs.artifacts = vec![Artifact {
        location: s3_location("out", "result"),
        ..Artifact::new("result", "/tmp/result")
    }];

    let pod = created(
        synthesize(&ControllerConfig::default(), &wf, &collaborators(&cluster), &tmpl, main)
            .await
            .unwrap(),
    );
    let volumes = pod.spec.unwrap().volumes.unwrap();
    let mut seen = HashSet::new();
    for volume in &volumes {
        assert!(seen.insert(volume.name.clone()), "duplicate volume {}", volume.name);
    }
}

#[tokio::test]
async fn user_volume_named_like_a_credential_secret_is_rejected() {
    let cluster = Arc::new(FakeCluster::default());
    let mut main = main_container();
    main.volume_mounts = Some(vec![VolumeMount {
        name: "s3-creds".into(),
        mount_path: "/scratch".into(),
        ..Default::default()
    }]);
    let mut tmpl = Template::container("t", main.clone());
    tmpl.volumes = vec![Volume {
        name: "s3-creds".into(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    tmpl.inputs.artifacts = vec![input_artifact("a", "/in/a")];

    let err = synthesize(
        &ControllerConfig::default(),
        &workflow(),
        &collaborators(&cluster),
        &tmpl,
        main,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::BadRequest { .. }));
    assert!(err.to_string().contains("'s3-creds'"));
    assert_eq!(cluster.create_calls(), 0);
}

#[tokio::test]
async fn shared_secret_becomes_one_volume() {
    let cluster = Arc::new(FakeCluster::default());
    let mut tmpl = Template::container("t", main_container());
    tmpl.inputs.artifacts = vec![input_artifact("a", "/in/a"), input_artifact("b", "/in/b")];

    let pod = created(
        synthesize(
            &ControllerConfig::default(),
            &workflow(),
            &collaborators(&cluster),
            &tmpl,
            main_container(),
        )
        .await
        .unwrap(),
    );
    let secrets: Vec<_> = pod
        .spec
        .unwrap()
        .volumes
        .unwrap()
        .into_iter()
        .filter_map(|v| v.secret)
        .filter(|s| s.secret_name.as_deref() == Some("s3-creds"))
        .collect();
    assert_eq!(secrets.len(), 1);
    let keys: Vec<_> = secrets[0]
        .items
        .iter()
        .flatten()
        .map(|item| item.key.as_str())
        .collect();
    assert_eq!(keys, vec!["accesskey", "secretkey"]);
}

#[tokio::test]
async fn artifact_inside_user_mount_is_not_mounted_on_main() {
    let cluster = Arc::new(FakeCluster::default());
    let mut main = main_container();
    main.volume_mounts = Some(vec![VolumeMount {
        name: "data".into(),
        mount_path: "/data".into(),
        ..Default::default()
    }]);
    let mut tmpl = Template::container("t", main.clone());
    tmpl.volumes = vec![Volume {
        name: "data".into(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    tmpl.inputs.artifacts = vec![input_artifact("nested", "/data/sub")];

    let pod = created(
        synthesize(&ControllerConfig::default(), &workflow(), &collaborators(&cluster), &tmpl, main)
            .await
            .unwrap(),
    );
    let spec = pod.spec.unwrap();
    let main = spec
        .containers
        .iter()
        .find(|c| c.name == MAIN_CONTAINER_NAME)
        .unwrap();
    assert!(!main
        .volume_mounts
        .iter()
        .flatten()
        .any(|m| m.name == INPUT_ARTIFACTS_VOLUME_NAME));
}

// =============================================================================
// Creation
// =============================================================================

#[tokio::test]
async fn second_synthesis_returns_existing_pod() {
    let cluster = Arc::new(FakeCluster::default());
    let collaborators = collaborators(&cluster);
    let wf = workflow();
    let tmpl = Template::container("t", main_container());
    let config = ControllerConfig::default();

    let first = created(
        synthesize(&config, &wf, &collaborators, &tmpl, main_container())
            .await
            .unwrap(),
    );
    let second = synthesize(&config, &wf, &collaborators, &tmpl, main_container())
        .await
        .unwrap();

    assert!(matches!(second, SynthesisOutcome::Existing(_)));
    let existing = second.into_pod().unwrap();
    assert_eq!(existing.metadata.name, first.metadata.name);
    assert_eq!(cluster.create_calls(), 1);
}

#[tokio::test]
async fn tighter_template_deadline_wins() {
    let cluster = Arc::new(FakeCluster::default());
    let mut wf = workflow();
    wf.deadline = Some(now() + Duration::seconds(60));
    let mut tmpl = Template::container("t", main_container());
    tmpl.active_deadline_seconds = Some(IntOrString::Int(30));

    let pod = created(
        synthesize(&ControllerConfig::default(), &wf, &collaborators(&cluster), &tmpl, main_container())
            .await
            .unwrap(),
    );
    assert_eq!(pod.spec.unwrap().active_deadline_seconds, Some(30));
}

#[tokio::test]
async fn passed_workflow_deadline_creates_nothing() {
    let cluster = Arc::new(FakeCluster::default());
    let mut wf = workflow();
    wf.deadline = Some(now() - Duration::seconds(1));
    let tmpl = Template::container("t", main_container());

    let outcome = synthesize(
        &ControllerConfig::default(),
        &wf,
        &collaborators(&cluster),
        &tmpl,
        main_container(),
    )
    .await
    .unwrap();
    assert!(matches!(
        outcome,
        SynthesisOutcome::Skipped(SkipReason::DeadlineExpired)
    ));
    assert_eq!(cluster.create_calls(), 0);
}

#[tokio::test]
async fn non_positive_template_deadline_creates_nothing() {
    for seconds in [0, -5] {
        let cluster = Arc::new(FakeCluster::default());
        let mut tmpl = Template::container("t", main_container());
        tmpl.active_deadline_seconds = Some(IntOrString::Int(seconds));

        let outcome = synthesize(
            &ControllerConfig::default(),
            &workflow(),
            &collaborators(&cluster),
            &tmpl,
            main_container(),
        )
        .await
        .unwrap();
        assert!(
            matches!(outcome, SynthesisOutcome::Skipped(SkipReason::DeadlineExpired)),
            "activeDeadlineSeconds {} should expire the step",
            seconds
        );
        assert_eq!(cluster.create_calls(), 0);
    }
}

#[tokio::test]
async fn invalid_pod_spec_patch_creates_nothing() {
    let cluster = Arc::new(FakeCluster::default());
    let mut tmpl = Template::container("t", main_container());
    tmpl.pod_spec_patch = Some(r#"{"containers": [{"name": "main", "resources": 5}]}"#.into());

    let err = synthesize(
        &ControllerConfig::default(),
        &workflow(),
        &collaborators(&cluster),
        &tmpl,
        main_container(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::BadRequest { .. }));
    assert_eq!(cluster.create_calls(), 0);
}

#[tokio::test]
async fn rate_limit_denial_creates_nothing() {
    let cluster = Arc::new(FakeCluster::default());
    let mut collaborators = collaborators(&cluster);
    collaborators.rate_limiter = Arc::new(DenyAll);
    let tmpl = Template::container("t", main_container());

    let err = synthesize(
        &ControllerConfig::default(),
        &workflow(),
        &collaborators,
        &tmpl,
        main_container(),
    )
    .await
    .unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(cluster.create_calls(), 0);
}

#[tokio::test]
async fn placeholders_resolved_across_the_pod() {
    let cluster = Arc::new(FakeCluster::default());
    let mut main = main_container();
    main.args = Some(vec!["{{workflow.name}} on {{pod.name}}".into()]);
    let tmpl = Template::container("t", main.clone());

    let pod = created(
        synthesize(&ControllerConfig::default(), &workflow(), &collaborators(&cluster), &tmpl, main)
            .await
            .unwrap(),
    );
    let name = pod.metadata.name.clone().unwrap();
    let spec = pod.spec.unwrap();
    let main = spec
        .containers
        .iter()
        .find(|c| c.name == MAIN_CONTAINER_NAME)
        .unwrap();
    assert_eq!(
        main.args.as_deref().unwrap(),
        [format!("wf on {}", name)]
    );
    assert_eq!(pod.metadata.labels.unwrap()[LABEL_WORKFLOW], "wf");
}
