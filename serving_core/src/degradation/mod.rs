//! # Graceful Degradation
//!
//! - **`level`**: the five levels and their service modes.
//! - **`policy`**: feature names and the cumulative per-level policy.
//! - **`controller`**: the state machine and its background loop.

/// Levels and modes.
pub mod level;
/// Feature policy.
pub mod policy;
/// The state machine.
pub mod controller;

pub use controller::{
    DegradationController, DegradationInputs, DegradationState, DegradationStatus, Transition, TransitionKind,
};
pub use level::{DegradationLevel, ServiceMode};
pub use policy::{policy_for, FeaturePolicy};
