//! # Inference Requests and Results
//!
//! The unit of work flowing through the engine. A request carries an opaque
//! JSON feature payload plus the scheduling metadata (priority, urgency,
//! timeout, batch eligibility) every other component keys its decisions on.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{Result, ServingError};

/// # Request Priority
///
/// Priority tiers in ascending order. Batch formation drains tiers from
/// `Critical` down to `Low`, and each tier is strictly FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Background or best-effort work.
    Low = 0,
    /// Default tier.
    Normal = 1,
    /// Latency sensitive work.
    High = 2,
    /// Must be served first, always.
    Critical = 3,
}

impl Priority {
    /// All tiers, highest first: the batch drain order.
    pub const DRAIN_ORDER: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

    /// Index used for per-tier arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Anything that can sit in a `PriorityQueueSet`.
pub trait Prioritized {
    /// The tier this item belongs to.
    fn priority(&self) -> Priority;
}

/// # Inference Request
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Unique identifier.
    pub id: String,
    /// Opaque feature payload passed through to the backend.
    pub features: Value,
    /// Queue tier.
    pub priority: Priority,
    /// Wall-clock submission time.
    pub submitted_at: DateTime<Utc>,
    /// Deadline measured from submission.
    pub timeout: Duration,
    /// Urgency score in `[0, 1]`; at or above the router threshold the
    /// immediate path is mandatory.
    pub urgency: f64,
    /// Whether the request may wait for a batch.
    pub batch_eligible: bool,
    /// Relative cost estimate in `[0, 1]` used by the router.
    pub complexity: f64,
}

impl InferenceRequest {
    /// Create a `Normal` priority, batch-eligible request with a 1s timeout.
    pub fn new(features: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            features,
            priority: Priority::Normal,
            submitted_at: Utc::now(),
            timeout: Duration::from_secs(1),
            urgency: 0.0,
            batch_eligible: true,
            complexity: 0.5,
        }
    }

    /// Set the priority tier.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the urgency score.
    pub fn with_urgency(mut self, urgency: f64) -> Self {
        self.urgency = urgency;
        self
    }

    /// Set the complexity estimate.
    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = complexity;
        self
    }

    /// Mark whether the request may be batched.
    pub fn with_batch_eligible(mut self, eligible: bool) -> Self {
        self.batch_eligible = eligible;
        self
    }

    /// Override the generated identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Reject malformed requests before they consume any budget.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ServingError::validation("request id must not be empty"));
        }
        if self.features.is_null() {
            return Err(ServingError::validation(format!("request {} has no feature payload", self.id)));
        }
        if !(0.0..=1.0).contains(&self.urgency) || self.urgency.is_nan() {
            return Err(ServingError::validation(format!(
                "request {} urgency {} outside [0, 1]",
                self.id, self.urgency
            )));
        }
        if !(0.0..=1.0).contains(&self.complexity) || self.complexity.is_nan() {
            return Err(ServingError::validation(format!(
                "request {} complexity {} outside [0, 1]",
                self.id, self.complexity
            )));
        }
        if self.timeout.is_zero() {
            return Err(ServingError::validation(format!("request {} has a zero timeout", self.id)));
        }
        Ok(())
    }
}

impl Prioritized for InferenceRequest {
    fn priority(&self) -> Priority {
        self.priority
    }
}

/// Path a request was dispatched through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteStrategy {
    /// Bypass batching on the reserved worker lane.
    Immediate,
    /// Enqueue and wait for batch formation.
    Batched,
    /// Call the backend synchronously on a general worker.
    Direct,
}

impl fmt::Display for RouteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteStrategy::Immediate => "immediate",
            RouteStrategy::Batched => "batched",
            RouteStrategy::Direct => "direct",
        };
        f.write_str(s)
    }
}

/// # Inference Result
///
/// What a caller receives for a successful submission. `degraded` and
/// `individual_fallback_used` are informational tags, not failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    /// Identifier of the originating request.
    pub request_id: String,
    /// Backend (or fallback strategy) output.
    pub output: Value,
    /// End-to-end latency observed by the engine.
    pub latency_ms: f64,
    /// Dispatch path taken.
    pub strategy: RouteStrategy,
    /// Batch the request was served in, if any.
    pub batch_id: Option<String>,
    /// The batch call failed and this item was served by a single-item call.
    pub individual_fallback_used: bool,
    /// Served while features were reduced or by a fallback capability.
    pub degraded: bool,
    /// Name of the fallback capability that produced `output`, if any.
    pub fallback: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::DRAIN_ORDER[0], Priority::Critical);
    }

    #[test]
    fn validation_rejects_bad_urgency_and_timeout() {
        let req = InferenceRequest::new(json!({"x": 1})).with_urgency(1.5);
        assert!(matches!(req.validate(), Err(ServingError::Validation(_))));

        let req = InferenceRequest::new(json!({"x": 1})).with_timeout(Duration::ZERO);
        assert!(req.validate().is_err());

        let req = InferenceRequest::new(Value::Null);
        assert!(req.validate().is_err());

        let req = InferenceRequest::new(json!([1, 2, 3])).with_urgency(0.95);
        assert!(req.validate().is_ok());
    }
}
