//! # Optimization Snapshots
//!
//! Records captured before an optimization is applied and the events written
//! when one is undone.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::performance::PerformanceMetrics;

/// Kind of change a snapshot protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptimizationType {
    /// Quantized model variant.
    Quantization,
    /// Pruned model weights; restored from the artifact backup.
    ModelPruning,
    /// GPU offload.
    GpuAcceleration,
    /// Batch size bounds.
    BatchSizeTuning,
    /// Object cache sizing.
    CacheTuning,
    /// Model hyperparameters.
    HyperparameterTuning,
    /// Anything else; has no restore routine.
    Custom(String),
}

/// How a snapshot is undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreRoutine {
    /// Copy the backed-up artifact back into place.
    ArtifactRestore,
    /// Switch the optimization off.
    FeatureDisable,
    /// Re-apply the configuration captured in the snapshot.
    ConfigRevert,
}

impl OptimizationType {
    /// The restore routine of this type; `None` for unrecognised types.
    pub fn restore_routine(&self) -> Option<RestoreRoutine> {
        match self {
            OptimizationType::ModelPruning => Some(RestoreRoutine::ArtifactRestore),
            OptimizationType::Quantization | OptimizationType::GpuAcceleration => Some(RestoreRoutine::FeatureDisable),
            OptimizationType::BatchSizeTuning
            | OptimizationType::CacheTuning
            | OptimizationType::HyperparameterTuning => Some(RestoreRoutine::ConfigRevert),
            OptimizationType::Custom(_) => None,
        }
    }
}

impl fmt::Display for OptimizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationType::Quantization => f.write_str("quantization"),
            OptimizationType::ModelPruning => f.write_str("model_pruning"),
            OptimizationType::GpuAcceleration => f.write_str("gpu_acceleration"),
            OptimizationType::BatchSizeTuning => f.write_str("batch_size_tuning"),
            OptimizationType::CacheTuning => f.write_str("cache_tuning"),
            OptimizationType::HyperparameterTuning => f.write_str("hyperparameter_tuning"),
            OptimizationType::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// A backed-up file and its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBackup {
    /// Where the artifact lives while in use.
    pub original_path: PathBuf,
    /// Copy taken at snapshot time.
    pub backup_path: PathBuf,
    /// Hex SHA-256 of the backup content.
    pub sha256: String,
}

/// # Optimization Snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSnapshot {
    /// Unique id.
    pub id: String,
    /// What was changed.
    pub optimization: OptimizationType,
    /// Configuration in force before the change.
    pub config: Value,
    /// Performance before the change.
    pub baseline: PerformanceMetrics,
    /// Backed-up artifact, if one was supplied.
    pub artifact: Option<ArtifactBackup>,
    /// Capture time.
    pub created_at: DateTime<Utc>,
}

/// Why a rollback happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RollbackReason {
    /// A metric or the latency trend regressed past the threshold.
    PerformanceDegradation,
    /// Too many errors since the snapshot.
    ErrorThresholdExceeded,
    /// Latencies vary too much.
    Instability,
    /// Requested by an operator.
    Manual,
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RollbackReason::PerformanceDegradation => "performance_degradation",
            RollbackReason::ErrorThresholdExceeded => "error_threshold_exceeded",
            RollbackReason::Instability => "instability",
            RollbackReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// # Rollback Event
///
/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEvent {
    /// Snapshot that was undone.
    pub snapshot_id: String,
    /// Its optimization type.
    pub optimization: OptimizationType,
    /// Primary reason.
    pub reason: RollbackReason,
    /// Free-form detail (regressed metrics, operator note...).
    pub detail: String,
    /// Metrics measured just before the restore.
    pub before: Option<PerformanceMetrics>,
    /// Metrics measured just after the restore.
    pub after: Option<PerformanceMetrics>,
    /// Whether the restore routine completed.
    pub success: bool,
    /// Failure description when `success` is false.
    pub error: Option<String>,
    /// Time the restore took.
    pub recovery_ms: f64,
    /// When the rollback ran.
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one `monitor` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackDecision {
    /// Snapshot monitored.
    pub snapshot_id: String,
    /// Whether any flag was raised.
    pub should_rollback: bool,
    /// Raised flags.
    pub reasons: Vec<RollbackReason>,
    /// Human readable description of each regression.
    pub details: Vec<String>,
    /// The rollback executed because of this decision.
    pub executed: Option<RollbackEvent>,
}

/// Aggregates over the rollback history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Rollbacks ever recorded.
    pub total: usize,
    /// Successful ones.
    pub successful: usize,
    /// Failed ones.
    pub failed: usize,
    /// `successful / total`, 1.0 when empty.
    pub success_rate: f64,
    /// Mean recovery time of successful rollbacks.
    pub average_recovery_ms: f64,
    /// Rollbacks within the last hour.
    pub last_hour: usize,
    /// Count per optimization type.
    pub by_type: std::collections::BTreeMap<String, usize>,
    /// Count per reason.
    pub by_reason: std::collections::BTreeMap<String, usize>,
    /// Snapshots still monitored.
    pub active_snapshots: usize,
}

/// # Rollback Target
///
/// The live system a restore routine acts on.
pub trait RollbackTarget: Send + Sync + 'static {
    /// Switch `optimization` off.
    fn disable_optimization(&self, optimization: &OptimizationType) -> Result<()>;

    /// Re-apply `config`, captured before `optimization` was applied.
    fn revert_config(&self, optimization: &OptimizationType, config: &Value) -> Result<()>;

    /// Live performance, used for before/after measurements.
    fn current_metrics(&self) -> Option<PerformanceMetrics>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_types_have_no_restore_routine() {
        assert_eq!(OptimizationType::Custom("x".into()).restore_routine(), None);
        assert_eq!(
            OptimizationType::BatchSizeTuning.restore_routine(),
            Some(RestoreRoutine::ConfigRevert)
        );
        assert_eq!(OptimizationType::Custom("warmup".into()).to_string(), "custom:warmup");
    }
}
