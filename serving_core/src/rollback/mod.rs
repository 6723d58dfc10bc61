//! # Optimization Rollback
//!
//! Snapshot, monitor and undo optimizations; only this subsystem persists
//! state across restarts.

/// Snapshot, event and target types.
pub mod snapshot;
/// Append-only persistence.
pub mod store;
/// The controller.
pub mod controller;

pub use controller::RollbackController;
pub use snapshot::{
    ArtifactBackup, OptimizationSnapshot, OptimizationType, RestoreRoutine, RollbackDecision, RollbackEvent,
    RollbackReason, RollbackReport, RollbackTarget,
};
pub use store::RollbackStore;
