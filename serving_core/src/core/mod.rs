//! # Core Types
//!
//! The vocabulary shared by every subsystem: requests and results, the model
//! backend capability, and the hardware probe.
//!
//! - **`request`**: `InferenceRequest`, `Priority`, `RouteStrategy` and
//!   `InferenceResult`.
//! - **`backend`**: the opaque `ModelBackend`, its capability flags, and the
//!   `FallbackStrategy` used at the Critical degradation level.
//! - **`probe`**: `HardwareProbe` and the `HardwareSample` it returns.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Requests, priorities and results.
pub mod request;
/// The external decision model and fallback capabilities.
pub mod backend;
/// Host measurements.
pub mod probe;

pub use backend::{
    BackendCapabilities, BackendError, BatchPrediction, FallbackStrategy, ModelBackend, Prediction, TrainingMetrics,
};
pub use probe::{HardwareProbe, HardwareSample};
pub use request::{InferenceRequest, InferenceResult, Prioritized, Priority, RouteStrategy};
