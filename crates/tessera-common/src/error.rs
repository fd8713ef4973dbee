//! Error types for the Tessera operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the cluster it concerns where one is known, so the
//! controller can log and requeue without re-deriving context.

use std::fmt;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// One object the desired-state applier could not write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyFailure {
    /// Object reference, `Kind namespace/name`
    pub object: String,
    /// Why the write failed
    pub message: String,
}

impl fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.object, self.message)
    }
}

fn join_failures(failures: &[ApplyFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Main error type for Tessera operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The desired-state snapshot for a pass could not be assembled
    #[error("failed to build spec for {cluster}: {message}")]
    SpecBuild {
        /// Name of the cluster being reconciled
        cluster: String,
        /// What was missing or malformed
        message: String,
    },

    /// Validation error for cluster or machine configuration
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.datastore")
        field: Option<String>,
    },

    /// The workload cluster's API could not be reached or a client could not be built
    #[error("workload cluster {cluster} unreachable: {message}")]
    RemoteUnreachable {
        /// Cluster identity (`namespace/name`)
        cluster: String,
        /// Underlying cause
        message: String,
    },

    /// One or more desired objects failed to apply
    #[error("failed to apply {} object(s): {}", .failures.len(), join_failures(.failures))]
    ObjectApply {
        /// Every object that failed, in producer order
        failures: Vec<ApplyFailure>,
    },

    /// Infrastructure credentials missing or unreadable
    #[error("credentials error: {message}")]
    Credentials {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// External command (govc) failure
    #[error("command `{command}` failed: {message}")]
    Command {
        /// Command that was run, without secrets
        command: String,
        /// Captured stderr or spawn error
        message: String,
    },

    /// The pass was cancelled while a phase was running
    #[error("reconciliation cancelled during phase {phase}")]
    Cancelled {
        /// Phase that was interrupted
        phase: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "controller", "registry")
        context: String,
    },
}

impl Error {
    /// Create a spec build error for a cluster
    pub fn spec_build(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SpecBuild {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a remote-unreachable error for a workload cluster
    pub fn remote_unreachable(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RemoteUnreachable {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a credentials error
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials {
            message: msg.into(),
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

    /// Create a command error
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error for the interrupted phase
    pub fn cancelled(phase: impl Into<String>) -> Self {
        Self::Cancelled {
            phase: phase.into(),
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

    /// Check if this error is retryable
    ///
    /// Validation, spec and serialization errors need a configuration change.
    /// Kubernetes errors depend on the HTTP status.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::SpecBuild { .. } => true, // referenced objects may appear later
            Error::Validation { .. } => false,
            Error::RemoteUnreachable { .. } => true,
            Error::ObjectApply { .. } => true,
            Error::Credentials { .. } => true,
            Error::Serialization { .. } => false,
            Error::Command { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error means the API server could not be reached at all
    ///
    /// Used to evict cached workload clients whose endpoint or credentials
    /// stopped working.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::RemoteUnreachable { .. } => true,
            Error::Kube { source } => matches!(
                source,
                kube::Error::HyperError(_) | kube::Error::Service(_)
            ),
            _ => false,
        }
    }
}
