//! Error types for the CSM Module Operator
//!
//! Provides structured error types for every stage of module composition:
//! precheck, version resolution, rendering, injection and apply/delete.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Reconciliation cancelled")]
    Cancelled,

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Failed to apply {object}: {reason}")]
    Apply { object: String, reason: String },

    #[error("Failed to delete {object}: {reason}")]
    Delete { object: String, reason: String },

    #[error("Finalizer error: {0}")]
    Finalizer(String),

    // =========================================================================
    // Precheck Errors
    // =========================================================================
    #[error("CSM {module} does not support {driver} driver")]
    UnsupportedDriver { module: String, driver: String },

    #[error("failed to find {kind} {name} in namespace {namespace}")]
    MissingPrerequisite {
        kind: String,
        name: String,
        namespace: String,
    },

    // =========================================================================
    // Version Errors
    // =========================================================================
    #[error(
        "CSM {module} does not have {requested} version. The following are supported versions: {}",
        .supported.join(",")
    )]
    UnsupportedVersion {
        module: String,
        requested: String,
        supported: Vec<String>,
    },

    #[error("No default {module} version for {driver} driver config version {driver_version}")]
    DefaultVersionNotFound {
        module: String,
        driver: String,
        driver_version: String,
    },

    #[error("Failed to read template directory {}: {source}", .path.display())]
    TemplateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Render / Inject Errors
    // =========================================================================
    #[error("Failed to read template {}: {source}", .path.display())]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to render {artifact} for {module}: {reason}")]
    Render {
        module: String,
        artifact: String,
        reason: String,
    },

    #[error("Cannot inject into {workload}: {reason}")]
    Inject { workload: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Apply { .. } | Error::Delete { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            // Operator must create the resource; poll for it
            Error::MissingPrerequisite { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(30))
            }

            // Template store may be remounted with a new config map
            Error::TemplateDirectory { .. } | Error::TemplateRead { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // The custom resource itself must change
            Error::UnsupportedDriver { .. }
            | Error::UnsupportedVersion { .. }
            | Error::DefaultVersionNotFound { .. }
            | Error::Render { .. }
            | Error::Inject { .. }
            | Error::Configuration(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error means the object is already absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this is an API conflict (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_version_message_lists_versions() {
        let err = Error::UnsupportedVersion {
            module: "authorization".into(),
            requested: "v100000.0.0".into(),
            supported: vec!["v2.11.0".into(), "v2.12.0".into(), "v2.13.0".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("v100000.0.0"));
        assert!(msg.ends_with("v2.11.0,v2.12.0,v2.13.0"));
    }

    #[test]
    fn test_error_actions() {
        let err = Error::MissingPrerequisite {
            kind: "secret".into(),
            name: "proxy-authz-tokens".into(),
            namespace: "isilon".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );

        let err = Error::UnsupportedDriver {
            module: "csireverseproxy".into(),
            driver: "powerscale".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
        assert!(!err.is_retryable());

        let err = Error::Apply {
            object: "Deployment/isilon/isilon-controller".into(),
            reason: "conflict".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_found_classification() {
        let err = Error::ResourceNotFound {
            kind: "Secret".into(),
            name: "missing".into(),
        };
        assert!(err.is_not_found());
        assert!(!Error::Cancelled.is_not_found());
    }
}
