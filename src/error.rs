//! Error types for the Kubexpose operator

use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(String),
    /// Remote command execution inside a pod failed
    #[error("Exec error: {0}")]
    Exec(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// The Kubexpose spec cannot be acted on
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),
    /// Invalid resource state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::KubeApi(err.to_string())
    }
}

/// Returns true when the API server answered 409 with reason `AlreadyExists`.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}
