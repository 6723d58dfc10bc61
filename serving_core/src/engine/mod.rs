//! # Engine
//!
//! - **`engine`**: `ServingEngine`, the request entry point and owner of the
//!   background tasks.
//! - **`tunables`**: the knobs optimizations change and rollbacks restore.

/// The orchestrator.
pub mod engine;
/// Optimization-controlled state.
pub mod tunables;

pub use engine::{EngineBuilder, EngineStats, ServingEngine};
pub use tunables::{TunableState, Tunables, INFERENCE_OP};
