//! Custom error types for cni-migration.

use thiserror::Error;

use crate::phase::MigrationPhase;

/// Errors that can occur while migrating a cluster between network plugins.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Step {} ({}) not ready: earlier work has not completed", .0.index(), .0)]
    PreconditionNotMet(MigrationPhase),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Conflict updating {0}")]
    Conflict(String),

    #[error("Connectivity check failed: {0}")]
    Connectivity(String),

    #[error("Timeout waiting for {kind} {namespace}/{name} to become ready: {ready}/{desired}")]
    ReadinessTimeout {
        kind: String,
        namespace: String,
        name: String,
        ready: i32,
        desired: i32,
    },

    #[error("Timeout waiting for {operation}: {details}")]
    Timeout { operation: String, details: String },

    #[error("Command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Operation cancelled by signal")]
    Cancelled,
}

impl MigrationError {
    /// Wrap a kube client error, keeping 409 responses distinguishable.
    pub fn kube(operation: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 => {
                MigrationError::Conflict(format!("{}: {}", operation, resp.message))
            }
            _ => MigrationError::KubernetesApi(format!("{}: {}", operation, err)),
        }
    }

    /// Returns true when the error came from an optimistic-concurrency conflict.
    pub fn is_conflict(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<MigrationError>(),
            Some(MigrationError::Conflict(_))
        )
    }
}

/// Returns true when a kube error is a 404 from the API server.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}
