//! Error types for the capr planner
//!
//! Errors fall into three propagation classes. `Waiting` means progress
//! depends on another controller or the node agent and the caller should
//! simply re-enqueue. `Ignore` is a per-machine problem that is surfaced in
//! status but must not stop reconciliation of the rest of the cluster. Every
//! other variant is a hard error that triggers backoff.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for planner operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Progress depends on another actor; re-enqueue without backoff
    #[error("{message}")]
    Waiting {
        /// Human-readable description of what is being waited on
        message: String,
    },

    /// Per-machine failure that is reported but does not block other tiers
    #[error("{message}")]
    Ignore {
        /// Human-readable description of the machine failure
        message: String,
    },

    /// Invalid cluster or plan configuration
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the control plane with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The record kind being (de)serialized (if known)
        kind: Option<String>,
    },

    /// A long-running operation reached its terminal failed phase
    #[error("{operation} failed: {message}")]
    OperationFailed {
        /// Operation name (e.g., "encryption key rotation")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "store", "election")
        context: String,
    },
}

impl Error {
    /// Create a waiting error
    pub fn waiting(msg: impl Into<String>) -> Self {
        Self::Waiting {
            message: msg.into(),
        }
    }

    /// Create an ignorable per-machine error
    pub fn ignore(msg: impl Into<String>) -> Self {
        Self::Ignore {
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
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

    /// Create a serialization error with record kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an operation failure
    pub fn operation_failed(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: msg.into(),
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

    /// True if this error only signals that the caller should re-enqueue
    pub fn is_waiting(&self) -> bool {
        matches!(self, Error::Waiting { .. })
    }

    /// True if this error is a deferred per-machine failure
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Error::Ignore { .. })
    }

    /// True if the Kubernetes API reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True if the Kubernetes API rejected an update on a stale resource version
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and terminal operation failures need a spec
    /// change. Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Waiting { .. } => true,
            Error::Ignore { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::OperationFailed { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Prefix the message of a waiting or ignorable error, keeping its kind
    pub fn prefixed(self, prefix: &str) -> Self {
        match self {
            Error::Waiting { message } => Error::Waiting {
                message: format!("{prefix}{message}"),
            },
            Error::Ignore { message } => Error::Ignore {
                message: format!("{prefix}{message}"),
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "Test".to_string(),
                code,
            }),
        }
    }

    /// Story: the reconciler tells waits apart from real failures
    ///
    /// A plan that hasn't been applied yet is not a failure, so it must not
    /// trigger backoff or show up as an error condition.
    #[test]
    fn story_waiting_is_distinct_from_failure() {
        let err = Error::waiting("waiting for plan to be applied");
        assert!(err.is_waiting());
        assert!(!err.is_ignorable());
        assert_eq!(err.to_string(), "waiting for plan to be applied");

        let err = Error::internal_with_context("store", "secret has wrong type");
        assert!(!err.is_waiting());
        assert!(err.to_string().contains("[store]"));
    }

    /// Story: a broken worker is reported but does not stop the control plane
    #[test]
    fn story_ignorable_errors_keep_their_kind_when_prefixed() {
        let err = Error::ignore("worker-1 failed").prefixed("failing worker machine(s) ");
        assert!(err.is_ignorable());
        assert_eq!(err.to_string(), "failing worker machine(s) worker-1 failed");

        let hard = Error::validation("bad").prefixed("ignored: ");
        assert!(hard.to_string().starts_with("validation error"));
    }

    #[test]
    fn test_kube_status_classification() {
        assert!(api_error(404).is_not_found());
        assert!(api_error(409).is_conflict());
        assert!(api_error(409).is_retryable());
        assert!(!api_error(422).is_retryable());
        assert!(api_error(500).is_retryable());
    }

    #[test]
    fn test_terminal_errors_are_not_retryable() {
        assert!(!Error::operation_failed("encryption key rotation", "stage mismatch").is_retryable());
        assert!(!Error::validation_for("cp", "bad").is_retryable());
        assert!(!Error::serialization_for_kind("plan", "eof").is_retryable());
    }

    #[test]
    fn test_json_errors_convert_to_serialization() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
