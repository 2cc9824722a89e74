//! Error types surfaced by the deployment subsystem.

use thiserror::Error;

/// Errors raised while deploying or resolving resources.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeploymentError {
    /// The loader does not know the requested resource.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    /// The resource name is already registered with a different loader.
    #[error("resource '{0}' is already registered with a different loader")]
    AlreadyRegistered(String),
    /// The registry refused the registration.
    #[error("failed to register resource '{name}': {reason}")]
    Register {
        /// Resource being registered.
        name: String,
        /// Registry-provided reason.
        reason: String,
    },
    /// Unparseable deployment mode string.
    #[error("invalid deployment mode '{0}'")]
    InvalidMode(String),
}
