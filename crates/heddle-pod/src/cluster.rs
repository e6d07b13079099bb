//! Collaborators the synthesizer consumes
//!
//! Each seam is a trait so the synthesizer can be exercised against mocks,
//! with kube-backed implementations for production use.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use kube::api::PostParams;
use kube::runtime::reflector::Store;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use heddle_common::{Error, Result, ANNOTATION_NODE_ID};

use crate::config::ArtifactRepositorySettings;
use crate::types::{ArtifactLocation, NodeStatus, Template};

// =============================================================================
// Pod index
// =============================================================================

/// Locally cached index of step pods
///
/// Backed by a watch, so it can lag behind the API server.
#[cfg_attr(test, automock)]
pub trait PodIndex: Send + Sync {
    /// Pods in `namespace` belonging to the step with `node_id`
    fn pods_for_node(&self, namespace: &str, node_id: &str) -> Result<Vec<Pod>>;
}

/// Pod index backed by a reflector store
pub struct StorePodIndex {
    store: Store<Pod>,
}

impl StorePodIndex {
    /// Wrap a reflector store fed by a pod watch
    pub fn new(store: Store<Pod>) -> Self {
        Self { store }
    }
}

impl PodIndex for StorePodIndex {
    fn pods_for_node(&self, namespace: &str, node_id: &str) -> Result<Vec<Pod>> {
        let pods = self
            .store
            .state()
            .into_iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .filter(|pod| {
                pod.metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_NODE_ID))
                    .is_some_and(|id| id == node_id)
            })
            .map(|pod| (*pod).clone())
            .collect();
        Ok(pods)
    }
}

// =============================================================================
// Pod client
// =============================================================================

/// Pod operations against the API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Create a pod
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Fetch a pod by name
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod>;
}

/// Real pod client
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    /// Create a new KubePodClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }
}

// =============================================================================
// Service account tokens
// =============================================================================

/// Resolves the token secret of a service account
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceAccountTokens: Send + Sync {
    /// Name of the secret holding `service_account`'s API token
    async fn token_secret_name(&self, namespace: &str, service_account: &str) -> Result<String>;
}

/// Real token lookup
pub struct KubeServiceAccountTokens {
    client: Client,
}

impl KubeServiceAccountTokens {
    /// Create a new KubeServiceAccountTokens wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceAccountTokens for KubeServiceAccountTokens {
    async fn token_secret_name(&self, namespace: &str, service_account: &str) -> Result<String> {
        // Clusters that still auto-generate token secrets list them on the account
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let account = accounts.get(service_account).await?;
        let listed = account
            .secrets
            .unwrap_or_default()
            .into_iter()
            .filter_map(|s| s.name)
            .find(|name| name.starts_with(&format!("{}-token-", service_account)));
        if let Some(name) = listed {
            return Ok(name);
        }

        // Otherwise a manually created token secret is expected
        let secret_name = format!("{}.service-account-token", service_account);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match secrets.get_opt(&secret_name).await? {
            Some(_) => {
                debug!(secret = %secret_name, "using service account token secret");
                Ok(secret_name)
            }
            None => Err(Error::bad_request(format!(
                "service account {}/{} does not have a token",
                namespace, service_account
            ))),
        }
    }
}

// =============================================================================
// Artifact repository
// =============================================================================

/// The default artifact repository of the workflow
#[cfg_attr(test, automock)]
pub trait ArtifactRepository: Send + Sync {
    /// Location new artifacts are archived to
    fn to_location(&self) -> ArtifactLocation;

    /// Whether container logs are archived by default
    fn is_archive_logs(&self) -> bool;
}

/// Artifact repository read from controller configuration
#[derive(Clone, Debug, Default)]
pub struct ConfiguredArtifactRepository {
    location: ArtifactLocation,
    archive_logs: bool,
}

impl ConfiguredArtifactRepository {
    pub fn new(location: ArtifactLocation, archive_logs: bool) -> Self {
        Self {
            location,
            archive_logs,
        }
    }
}

impl From<&ArtifactRepositorySettings> for ConfiguredArtifactRepository {
    fn from(settings: &ArtifactRepositorySettings) -> Self {
        Self::new(settings.location.clone(), settings.archive_logs)
    }
}

impl ArtifactRepository for ConfiguredArtifactRepository {
    fn to_location(&self) -> ArtifactLocation {
        self.location.clone()
    }

    fn is_archive_logs(&self) -> bool {
        self.archive_logs
    }
}

// =============================================================================
// Template resolver
// =============================================================================

/// Recovers the template a node was executed from
#[cfg_attr(test, automock)]
pub trait TemplateResolver: Send + Sync {
    fn resolve(&self, node: &NodeStatus) -> Result<Template>;
}

/// Resolves templates by name from the workflow's own template list
#[derive(Clone, Debug, Default)]
pub struct WorkflowTemplates {
    templates: BTreeMap<String, Template>,
}

impl WorkflowTemplates {
    pub fn new(templates: impl IntoIterator<Item = Template>) -> Self {
        Self {
            templates: templates.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }
}

impl TemplateResolver for WorkflowTemplates {
    fn resolve(&self, node: &NodeStatus) -> Result<Template> {
        let name = node.template_name.as_deref().unwrap_or_default();
        self.templates.get(name).cloned().ok_or_else(|| {
            Error::bad_request(format!(
                "template {:?} of node {:?} not found",
                name, node.name
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Container;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::reflector;
    use kube::runtime::watcher;

    fn pod(namespace: &str, name: &str, node_id: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_NODE_ID.to_string(),
                    node_id.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_store_index_filters_by_namespace_and_node() {
        let (reader, mut writer) = reflector::store::<Pod>();
        for p in [
            pod("team-a", "wf-1", "wf-111"),
            pod("team-a", "wf-2", "wf-222"),
            pod("team-b", "wf-1", "wf-111"),
        ] {
            writer.apply_watcher_event(&watcher::Event::Apply(p));
        }

        let index = StorePodIndex::new(reader);
        let found = index.pods_for_node("team-a", "wf-111").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.name.as_deref(), Some("wf-1"));
        assert!(index.pods_for_node("team-c", "wf-111").unwrap().is_empty());
    }

    #[test]
    fn test_configured_repository() {
        let settings = ArtifactRepositorySettings {
            archive_logs: true,
            ..Default::default()
        };
        let repo = ConfiguredArtifactRepository::from(&settings);
        assert!(repo.is_archive_logs());
        assert_eq!(repo.to_location(), ArtifactLocation::default());
    }

    #[test]
    fn test_workflow_templates_resolve_by_name() {
        let resolver = WorkflowTemplates::new([Template::container("flaky", Container::default())]);
        let node = NodeStatus {
            name: "wf.flaky".to_string(),
            template_name: Some("flaky".to_string()),
            ..Default::default()
        };
        assert_eq!(resolver.resolve(&node).unwrap().name, "flaky");

        let missing = NodeStatus {
            template_name: Some("gone".to_string()),
            ..node
        };
        assert!(matches!(
            resolver.resolve(&missing).unwrap_err(),
            Error::BadRequest { .. }
        ));
    }
}
