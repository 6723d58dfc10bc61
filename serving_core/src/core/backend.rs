//! # Model Backend Capabilities
//!
//! The decision model is an external collaborator. The core only sees its
//! observable behaviour: outputs, elapsed time and failures. Calls are
//! synchronous and CPU bound; the engine always runs them on the bounded
//! worker pool, never on a request-handling task.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::errors::ServingError;

/// One backend output together with the time the backend spent on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Opaque decision payload.
    pub output: Value,
    /// Backend-reported elapsed time.
    pub elapsed_ms: f64,
}

/// Output of a batched call; `outputs[i]` answers `features[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPrediction {
    /// Outputs in input order.
    pub outputs: Vec<Value>,
    /// Backend-reported elapsed time for the whole batch.
    pub elapsed_ms: f64,
}

/// Metrics reported by a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Loss after training.
    pub loss: f64,
    /// Accuracy after training, if the backend evaluates it.
    pub accuracy: Option<f64>,
    /// Wall time of the run.
    pub duration_ms: f64,
}

/// # Backend Error
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Transient failure; retrying may succeed.
    #[error("backend failure: {0}")]
    Failed(String),
    /// A batch call answered only a prefix of its inputs.
    #[error("partial batch failure after {} outputs: {message}", completed.len())]
    Partial {
        /// Outputs for the first `completed.len()` inputs.
        completed: Vec<Value>,
        /// Why the remainder failed.
        message: String,
    },
    /// The input can never be served by this backend.
    #[error("permanent backend failure: {0}")]
    Permanent(String),
    /// Training failed.
    #[error("training failure: {0}")]
    Training(String),
}

impl From<BackendError> for ServingError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Permanent(message) => ServingError::Model {
                message,
                permanent: true,
            },
            other => ServingError::Model {
                message: other.to_string(),
                permanent: false,
            },
        }
    }
}

/// Capabilities the engine queries once at start-up instead of probing
/// optional features through failed calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// `predict_batch` is more efficient than repeated `predict`.
    pub batch_support: bool,
    /// The backend can run on a GPU.
    pub gpu: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            batch_support: true,
            gpu: false,
        }
    }
}

/// # Model Backend
///
/// Implementations must be thread safe: the worker pool calls them from
/// several blocking threads at once.
pub trait ModelBackend: Send + Sync + 'static {
    /// Produce one decision.
    fn predict(&self, features: &Value) -> Result<Prediction, BackendError>;

    /// Produce one decision per input, in order.
    fn predict_batch(&self, features: &[Value]) -> Result<BatchPrediction, BackendError>;

    /// Train on `data`; `intensity` in `(0, 1]` scales the amount of work.
    fn train(&self, data: &Value, intensity: f64) -> Result<TrainingMetrics, BackendError>;

    /// Capability interface (`HasBatchSupport`, `HasGPU`).
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }
}

/// Rule-based decision capability used while the `rule_based_strategy`
/// fallback is active.
pub trait FallbackStrategy: Send + Sync + 'static {
    /// Name recorded on results served by this strategy.
    fn name(&self) -> &str;

    /// Produce a decision without touching the model backend.
    fn decide(&self, features: &Value) -> Value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn permanent_backend_errors_are_not_retryable() {
        let err: ServingError = BackendError::Permanent("unsupported input".into()).into();
        assert!(!err.retryable());

        let err: ServingError = BackendError::Partial {
            completed: vec![json!(1)],
            message: "oom".into(),
        }
        .into();
        assert!(err.retryable());
    }
}
