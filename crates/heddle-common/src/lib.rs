//! Common types for heddle: errors, well-known labels, and utilities

#![deny(missing_docs)]

pub mod error;
pub mod telemetry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Pod labels
// =============================================================================

/// Label carrying the owning workflow's name, for filtering pods by workflow
pub const LABEL_WORKFLOW: &str = "heddle.dev/workflow";

/// Label marking whether the pod's step has completed
pub const LABEL_COMPLETED: &str = "heddle.dev/completed";

/// Label set on pods that belong to an exit handler
pub const LABEL_ON_EXIT: &str = "heddle.dev/on-exit";

/// Label carrying the controller instance ID when one is configured
pub const LABEL_CONTROLLER_INSTANCE_ID: &str = "heddle.dev/controller-instanceid";

// =============================================================================
// Pod annotations
// =============================================================================

/// Annotation holding the step's node name
pub const ANNOTATION_NODE_NAME: &str = "heddle.dev/node-name";

/// Annotation holding the step's node ID; the pod index is keyed on it
pub const ANNOTATION_NODE_ID: &str = "heddle.dev/node-id";

/// Annotation consumed by `kubectl logs/exec` to pick a container
pub const ANNOTATION_DEFAULT_CONTAINER: &str = "kubectl.kubernetes.io/default-container";

// =============================================================================
// Workflow resource identity
// =============================================================================

/// API version of the Workflow custom resource (owner of every step pod)
pub const WORKFLOW_API_VERSION: &str = "heddle.dev/v1alpha1";

/// Kind of the Workflow custom resource
pub const WORKFLOW_KIND: &str = "Workflow";
