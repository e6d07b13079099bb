//! Pod synthesis for heddle workflow steps
//!
//! Compiles a step's template, its workflow's settings and the controller
//! configuration into one Kubernetes Pod, then creates that pod at most once
//! per step. Executor containers, volumes, credentials, scheduling, deadlines
//! and user patches are all folded in along the way.
//!
//! # Usage
//!
//! ```rust,ignore
//! let outcome = PodSynthesizer::new(&config, &workflow, &collaborators)
//!     .with_create_timeout(Duration::from_secs(30))
//!     .synthesize(PodRequest::new(node_name, main_containers, &template))
//!     .await?;
//! ```

pub mod cluster;
pub mod config;
pub mod constants;
pub mod executor;
pub mod naming;
pub mod pipeline;
pub mod rate_limit;
mod synthesizer;
pub mod types;

pub use cluster::{
    ArtifactRepository, ConfiguredArtifactRepository, KubePodClient, KubeServiceAccountTokens,
    PodClient, PodIndex, ServiceAccountTokens, StorePodIndex, TemplateResolver, WorkflowTemplates,
};
pub use config::ControllerConfig;
pub use executor::ExecutorVariant;
pub use rate_limit::{RateLimiter, TokenBucket, Unlimited};
pub use synthesizer::{
    Collaborators, CreateOptions, PodRequest, PodSynthesizer, SkipReason, SynthesisOutcome,
};

pub use heddle_common::{Error, Result};
