//! # Engine Tunables
//!
//! The live knobs an optimization may change, and the `RollbackTarget` that
//! puts them back. Each optimization type owns a disjoint part of the state,
//! so `snapshot_config` only captures what a later `revert_config` needs.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{Result, ServingError};
use crate::performance::{PerformanceMetrics, PerformanceTracker};
use crate::rollback::{OptimizationType, RollbackTarget};

/// Operation type under which the engine records inference latencies.
pub const INFERENCE_OP: &str = "inference";

/// Current values of every tunable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunableState {
    /// Multiplier applied to the batch target, in `(0, 1]`.
    pub batch_size_factor: f64,
    /// Serve repeated payloads from the object cache.
    pub cache_results: bool,
    /// Quantized model variant in use.
    pub quantization: bool,
    /// GPU offload in use.
    pub gpu_acceleration: bool,
    /// Opaque model hyperparameters.
    pub hyperparameters: Value,
}

/// # Tunables
pub struct Tunables {
    state: RwLock<TunableState>,
    tracker: Arc<PerformanceTracker>,
}

impl Tunables {
    /// Tunables starting from `cache_results`, reading live metrics from `tracker`.
    pub fn new(cache_results: bool, tracker: Arc<PerformanceTracker>) -> Self {
        Self {
            state: RwLock::new(TunableState {
                batch_size_factor: 1.0,
                cache_results,
                quantization: false,
                gpu_acceleration: false,
                hyperparameters: Value::Null,
            }),
            tracker,
        }
    }

    /// Copy of the current values.
    pub fn state(&self) -> TunableState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Batch target multiplier.
    pub fn batch_size_factor(&self) -> f64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).batch_size_factor
    }

    /// Whether results are cached.
    pub fn cache_results(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).cache_results
    }

    /// The part of the state `optimization` is about to change.
    pub fn snapshot_config(&self, optimization: &OptimizationType) -> Value {
        let s = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match optimization {
            OptimizationType::BatchSizeTuning => json!({ "batch_size_factor": s.batch_size_factor }),
            OptimizationType::CacheTuning => json!({ "cache_results": s.cache_results }),
            OptimizationType::Quantization => json!({ "quantization": s.quantization }),
            OptimizationType::GpuAcceleration => json!({ "gpu_acceleration": s.gpu_acceleration }),
            OptimizationType::HyperparameterTuning => s.hyperparameters.clone(),
            OptimizationType::ModelPruning | OptimizationType::Custom(_) => Value::Null,
        }
    }

    /// Reject parameters `apply` could not honour, without changing anything.
    pub fn check(&self, optimization: &OptimizationType, config: &Value) -> Result<()> {
        if *optimization == OptimizationType::BatchSizeTuning {
            Self::factor(config)?;
        }
        Ok(())
    }

    /// # Apply
    ///
    /// Change the state as `optimization` with parameters `config` requires.
    pub fn apply(&self, optimization: &OptimizationType, config: &Value) -> Result<()> {
        self.check(optimization, config)?;
        let mut s = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match optimization {
            OptimizationType::BatchSizeTuning => {
                s.batch_size_factor = Self::factor(config)?;
            }
            OptimizationType::CacheTuning => {
                s.cache_results = config.get("cache_results").and_then(Value::as_bool).unwrap_or(true);
            }
            OptimizationType::Quantization => s.quantization = true,
            OptimizationType::GpuAcceleration => s.gpu_acceleration = true,
            OptimizationType::HyperparameterTuning => s.hyperparameters = config.clone(),
            OptimizationType::ModelPruning | OptimizationType::Custom(_) => {}
        }
        tracing::info!(optimization = %optimization, "optimization applied");
        Ok(())
    }

    fn factor(config: &Value) -> Result<f64> {
        let f = config
            .get("batch_size_factor")
            .and_then(Value::as_f64)
            .ok_or_else(|| ServingError::validation("batch_size_factor missing"))?;
        if !(f > 0.0 && f <= 1.0) {
            return Err(ServingError::validation(format!("batch_size_factor {f} outside (0, 1]")));
        }
        Ok(f)
    }
}

impl RollbackTarget for Tunables {
    fn disable_optimization(&self, optimization: &OptimizationType) -> Result<()> {
        let mut s = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match optimization {
            OptimizationType::Quantization => s.quantization = false,
            OptimizationType::GpuAcceleration => s.gpu_acceleration = false,
            other => {
                return Err(ServingError::validation(format!("'{other}' cannot be disabled")));
            }
        }
        Ok(())
    }

    fn revert_config(&self, optimization: &OptimizationType, config: &Value) -> Result<()> {
        match optimization {
            OptimizationType::BatchSizeTuning => {
                let f = Self::factor(config)?;
                self.state.write().unwrap_or_else(PoisonError::into_inner).batch_size_factor = f;
            }
            OptimizationType::CacheTuning => {
                let on = config
                    .get("cache_results")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| ServingError::validation("cache_results missing"))?;
                self.state.write().unwrap_or_else(PoisonError::into_inner).cache_results = on;
            }
            OptimizationType::HyperparameterTuning => {
                self.state.write().unwrap_or_else(PoisonError::into_inner).hyperparameters = config.clone();
            }
            other => {
                return Err(ServingError::validation(format!("'{other}' has no configuration to revert")));
            }
        }
        Ok(())
    }

    fn current_metrics(&self) -> Option<PerformanceMetrics> {
        self.tracker.current_metrics(INFERENCE_OP)
    }
}
