//! Adaptive serving core: priority batching, resource admission, graceful
//! degradation and optimization rollback around an opaque model backend.

// Declare the modules to re-export
pub mod batching;
pub mod configs;
pub mod core;
pub mod degradation;
pub mod engine;
pub mod errors;
pub mod loggers; // tracing subscriber setup and log file retention
pub mod performance;
pub mod resources;
pub mod rollback;
#[cfg(any(test, feature = "testing"))]
pub mod testing; // scripted probe, backend and rollback target
pub mod utils; // system probe and statistics helpers

// Re-export the public surface
pub use crate::core::{
    BackendCapabilities, BackendError, BatchPrediction, FallbackStrategy, HardwareProbe, HardwareSample,
    InferenceRequest, InferenceResult, ModelBackend, Prediction, Priority, RouteStrategy, TrainingMetrics,
};
pub use configs::{load_config, parse_config, EngineConfig};
pub use degradation::{DegradationController, DegradationLevel, ServiceMode};
pub use engine::{EngineBuilder, EngineStats, ServingEngine, INFERENCE_OP};
pub use errors::{Result, ServingError};
pub use loggers::{init_logging, LoggingGuard};
pub use performance::{ExecutionMetrics, PerformanceMetrics, PerformanceTracker};
pub use resources::ResourceManager;
pub use rollback::{OptimizationType, RollbackController, RollbackReason};
pub use utils::sys_info::SystemProbe;
