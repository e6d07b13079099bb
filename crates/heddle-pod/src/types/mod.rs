//! Workflow-side types consumed by the synthesizer
//!
//! These mirror the shape of the Workflow resource closely enough to be
//! deserialized from it, but only carry the fields pod synthesis reads.

mod artifact;
mod template;
mod workflow;

pub use artifact::{
    ArtifactLocation, ArtifactoryArtifact, Artifact, GcsArtifact, GitArtifact, HdfsArtifact,
    HttpArtifact, OssArtifact, RawArtifact, S3Artifact, SecretKeySelector,
};
pub use template::{
    ContainerNode, ContainerSetTemplate, DataSource, DataTemplate, ExecutorConfig, Inputs,
    Metadata, Outputs, Parameter, ResourceTemplate, RetryAffinity, RetryNodeAntiAffinity,
    RetryStrategy, ScriptTemplate, Template, TemplateBody, TemplateType, UserContainer,
};
pub use workflow::{
    NodePhase, NodeStatus, NodeType, ShutdownStrategy, WorkflowContext, WorkflowSpec,
};
