//! Error types for the auth manager

use std::time::Duration;

use thiserror::Error;

/// Main error type for authentication and authorization operations
///
/// Variants carry owned strings rather than source errors so that results
/// memoized behind shared futures can be cloned out to every caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthError {
    /// The cluster denied a specific access review probe
    #[error("requesting user cannot {verb} {resource} in namespace {namespace}: {reason}")]
    PermissionDenied {
        /// Namespace the probe ran against
        namespace: String,
        /// Canonical group-resource string of the probed resource
        resource: String,
        /// Kubernetes verb of the probe
        verb: String,
        /// Cluster-supplied denial reason, possibly empty
        reason: String,
    },

    /// The cluster rejected the token itself (token review error or
    /// authentication failure)
    #[error("authorization failure: {0}")]
    AuthorizationFailure(String),

    /// Transport-level failure against the cluster API
    #[error("kubernetes API error: {0}")]
    ClusterClient(String),

    /// A required environment variable is not set
    #[error("missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    /// Logout targeted a token the cluster does not know about
    #[error("no such active token")]
    TokenNotFound,

    /// Malformed input inside the core (programmer error)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The access review fan-out did not complete within its deadline
    #[error("access reviews did not complete within {0:?}")]
    Timeout(Duration),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Create an authorization failure with the given message
    pub fn authorization_failure(msg: impl Into<String>) -> Self {
        Self::AuthorizationFailure(msg.into())
    }

    /// Create a cluster client error with the given message
    pub fn cluster_client(msg: impl Into<String>) -> Self {
        Self::ClusterClient(msg.into())
    }

    /// Create an invalid argument error with the given message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this failure means the caller's credentials are missing,
    /// insufficient, or unusable, so that presenting fresh credentials
    /// (logging in again) could succeed.
    ///
    /// Anything else is an operational fault the caller cannot fix.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::AuthorizationFailure(_) | Self::ClusterClient(_)
        )
    }
}

impl From<kube::Error> for AuthError {
    fn from(err: kube::Error) -> Self {
        Self::ClusterClient(err.to_string())
    }
}
