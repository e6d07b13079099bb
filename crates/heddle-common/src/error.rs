//! Error types for pod synthesis
//!
//! Errors are grouped by how the caller must react to them:
//! - `BadRequest` is a user error; the step fails permanently
//! - `Kube` wraps API errors; transient ones are retried by the caller
//! - `Internal` and `Serialization` signal a bug rather than user error
//! - `RateLimitReached` means "try again on a later pass"
//! - `DeadlineExceeded` fails the step invocation

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status codes the API server returns for conditions that clear on their own
const TRANSIENT_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// Main error type for heddle operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The step's definition cannot be turned into a pod
    #[error("bad request: {message}")]
    BadRequest {
        /// Description of what's invalid
        message: String,
        /// The offending field path (e.g., "inputs.artifacts.code"), if known
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "pod-index", "create")
        context: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// The shared create rate limiter denied this attempt
    #[error("resource creation rate-limit reached")]
    RateLimitReached,

    /// The step ran out of time before its pod could be created
    #[error("{node} exceeded its deadline")]
    DeadlineExceeded {
        /// Name of the step's node
        node: String,
    },
}

impl Error {
    /// Create a bad-request error with the given message
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a bad-request error naming the offending field
    pub fn bad_request_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::BadRequest {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a deadline-exceeded error for a step
    pub fn deadline_exceeded(node: impl Into<String>) -> Self {
        Self::DeadlineExceeded { node: node.into() }
    }

    /// Check if this error is a transient API failure
    ///
    /// Throttling, server-side 5xx responses and connection failures clear on
    /// their own. Every other API response is treated as permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube { source } => is_transient_kube_error(source),
            _ => false,
        }
    }

    /// Check if this error should be retried on a later reconciliation pass
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => is_transient_kube_error(source),
            Error::RateLimitReached => true,
            Error::BadRequest { .. } => false,
            Error::Internal { .. } => false,
            Error::Serialization { .. } => false,
            Error::DeadlineExceeded { .. } => false,
        }
    }

    /// Check if this error is the rate-limit sentinel
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimitReached)
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

/// Classify a raw kube error as transient
pub fn is_transient_kube_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => TRANSIENT_STATUS_CODES.contains(&ae.code),
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

/// Check whether a kube error is the API server's "already exists" response
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}
