//! # Serving Error Taxonomy
//!
//! A single error type shared by every subsystem of the serving core. Each
//! variant maps onto one user-visible outcome class, and `retryable()` tells a
//! caller whether resubmitting the same request can succeed.
//!
//! Local remediation happens *before* an error reaches this type: the resource
//! manager retries once after an optimization pass, the batch processor falls
//! back to single-item calls, and the degradation controller absorbs bursts of
//! model errors by escalating. What surfaces here is what remediation could
//! not fix.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ServingError>;

/// # Serving Error
#[derive(Debug, Error)]
pub enum ServingError {
    /// The request was malformed (bad urgency, zero timeout, null payload...).
    #[error("validation error: {0}")]
    Validation(String),

    /// Budget could not be granted even after one optimization pass.
    #[error("resource exhausted for '{operation}': requested {requested_mb:.1}MB, available {available_mb:.1}MB")]
    ResourceExhausted {
        /// Operation type that asked for the budget.
        operation: String,
        /// Memory requested in megabytes.
        requested_mb: f64,
        /// Memory still available in the budget when the request was denied.
        available_mb: f64,
    },

    /// The request (or a backend call) exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The model backend failed.
    #[error("model error: {message}")]
    Model {
        /// Backend supplied failure description.
        message: String,
        /// Permanent failures are not worth retrying.
        permanent: bool,
    },

    /// The operation is unavailable because the service is running degraded.
    #[error("degraded service: {0}")]
    DegradedService(String),

    /// A restore routine could not undo an optimization.
    #[error("rollback of snapshot '{snapshot_id}' failed: {reason}")]
    RollbackFailure {
        /// Snapshot the rollback targeted.
        snapshot_id: String,
        /// Why the restore could not complete.
        reason: String,
    },

    /// The client abandoned the request.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// The engine has been closed and accepts no more work.
    #[error("serving engine is closed")]
    EngineClosed,

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O failure, typically while persisting rollback records.
    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure of persisted records.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServingError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a transient model error.
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model {
            message: msg.into(),
            permanent: false,
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a rollback failure.
    pub fn rollback_failure(snapshot_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RollbackFailure {
            snapshot_id: snapshot_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether resubmitting the same request may succeed.
    ///
    /// `Timeout` and `ResourceExhausted` are transient by nature; model errors
    /// are retryable unless the backend flagged them permanent.
    pub fn retryable(&self) -> bool {
        match self {
            ServingError::Timeout(_) | ServingError::ResourceExhausted { .. } => true,
            ServingError::Model { permanent, .. } => !permanent,
            _ => false,
        }
    }

    /// Short stable label used in logs and statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            ServingError::Validation(_) => "validation",
            ServingError::ResourceExhausted { .. } => "resource_exhausted",
            ServingError::Timeout(_) => "timeout",
            ServingError::Model { .. } => "model",
            ServingError::DegradedService(_) => "degraded_service",
            ServingError::RollbackFailure { .. } => "rollback_failure",
            ServingError::Cancelled(_) => "cancelled",
            ServingError::EngineClosed => "engine_closed",
            ServingError::Config(_) => "config",
            ServingError::Io(_) => "io",
            ServingError::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ServingError::timeout("slow").retryable());
        assert!(ServingError::ResourceExhausted {
            operation: "inference".into(),
            requested_mb: 10.0,
            available_mb: 1.0,
        }
        .retryable());
        assert!(ServingError::model("flaky").retryable());
        assert!(!ServingError::Model {
            message: "bad weights".into(),
            permanent: true
        }
        .retryable());
        assert!(!ServingError::validation("urgency").retryable());
        assert!(!ServingError::rollback_failure("s1", "missing").retryable());
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ServingError::EngineClosed.kind(), "engine_closed");
        assert_eq!(ServingError::timeout("x").kind(), "timeout");
    }
}
