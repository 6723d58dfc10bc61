//! # Test Doubles
//!
//! Scripted implementations of the engine's external seams: a probe whose
//! readings are set by hand, a backend whose failures are switched on and
//! off, and a rollback target that records what it was asked to undo. Used by
//! the unit and integration tests; other crates enable them with the
//! `testing` feature.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::core::{
    BackendCapabilities, BackendError, BatchPrediction, FallbackStrategy, HardwareProbe, HardwareSample,
    ModelBackend, Prediction, TrainingMetrics,
};
use crate::errors::{Result, ServingError};
use crate::performance::PerformanceMetrics;
use crate::rollback::{OptimizationType, RollbackTarget};

/// Probe returning whatever sample was last `set`.
pub struct ScriptedProbe {
    sample: Mutex<HardwareSample>,
}

impl ScriptedProbe {
    /// Probe starting at `sample`.
    pub fn new(sample: HardwareSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    /// Replace the reading.
    pub fn set(&self, sample: HardwareSample) {
        *self.sample.lock().unwrap_or_else(PoisonError::into_inner) = sample;
    }
}

impl HardwareProbe for ScriptedProbe {
    fn sample(&self) -> HardwareSample {
        self.sample.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// # Scripted Backend
///
/// Echoes its input as `{"input": features, "mode": "single" | "batch"}`.
/// Inputs carrying `"poison": true` fail permanently on single calls.
pub struct ScriptedBackend {
    caps: Mutex<BackendCapabilities>,
    latency: Mutex<Duration>,
    partial_batches: Mutex<Option<usize>>,
    fail_batches: AtomicBool,
    fail_single: AtomicBool,
    single_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    training_runs: AtomicU64,
    last_intensity: Mutex<Option<f64>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// A fast, healthy backend with batch support and no GPU.
    pub fn new() -> Self {
        Self {
            caps: Mutex::new(BackendCapabilities::default()),
            latency: Mutex::new(Duration::ZERO),
            partial_batches: Mutex::new(None),
            fail_batches: AtomicBool::new(false),
            fail_single: AtomicBool::new(false),
            single_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            training_runs: AtomicU64::new(0),
            last_intensity: Mutex::new(None),
        }
    }

    /// Builder-style capability override.
    pub fn with_capabilities(self, caps: BackendCapabilities) -> Self {
        *self.caps.lock().unwrap_or_else(PoisonError::into_inner) = caps;
        self
    }

    /// Sleep this long in every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Batch calls answer only their first `n` inputs.
    pub fn set_partial_batches(&self, n: usize) {
        *self.partial_batches.lock().unwrap_or_else(PoisonError::into_inner) = Some(n);
    }

    /// Batch calls fail outright.
    pub fn set_fail_batches(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::Release);
    }

    /// Single calls fail transiently.
    pub fn set_fail_single(&self, fail: bool) {
        self.fail_single.store(fail, Ordering::Release);
    }

    /// Single-item calls served so far.
    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::Acquire)
    }

    /// Batch calls served so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::Acquire)
    }

    /// Size of every batch call, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Training runs so far.
    pub fn training_runs(&self) -> u64 {
        self.training_runs.load(Ordering::Acquire)
    }

    /// Intensity of the latest training run.
    pub fn last_intensity(&self) -> Option<f64> {
        *self.last_intensity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pause(&self) -> Instant {
        let started = Instant::now();
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        started
    }
}

impl ModelBackend for ScriptedBackend {
    fn predict(&self, features: &Value) -> std::result::Result<Prediction, BackendError> {
        self.single_calls.fetch_add(1, Ordering::AcqRel);
        let started = self.pause();
        if features.get("poison").and_then(Value::as_bool).unwrap_or(false) {
            return Err(BackendError::Permanent("poisoned input".into()));
        }
        if self.fail_single.load(Ordering::Acquire) {
            return Err(BackendError::Failed("scripted single failure".into()));
        }
        Ok(Prediction {
            output: json!({ "input": features, "mode": "single" }),
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    fn predict_batch(&self, features: &[Value]) -> std::result::Result<BatchPrediction, BackendError> {
        self.batch_calls.fetch_add(1, Ordering::AcqRel);
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(features.len());
        let started = self.pause();
        if self.fail_batches.load(Ordering::Acquire) {
            return Err(BackendError::Failed("scripted batch failure".into()));
        }
        let outputs: Vec<Value> = features
            .iter()
            .map(|f| json!({ "input": f, "mode": "batch" }))
            .collect();
        if let Some(n) = *self.partial_batches.lock().unwrap_or_else(PoisonError::into_inner) {
            if n < outputs.len() {
                return Err(BackendError::Partial {
                    completed: outputs.into_iter().take(n).collect(),
                    message: "scripted partial failure".into(),
                });
            }
        }
        Ok(BatchPrediction {
            outputs,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    fn train(&self, data: &Value, intensity: f64) -> std::result::Result<TrainingMetrics, BackendError> {
        if data.is_null() {
            return Err(BackendError::Training("no training data".into()));
        }
        self.training_runs.fetch_add(1, Ordering::AcqRel);
        *self.last_intensity.lock().unwrap_or_else(PoisonError::into_inner) = Some(intensity);
        let started = self.pause();
        Ok(TrainingMetrics {
            loss: 0.5 * (1.0 - intensity / 2.0),
            accuracy: Some(0.8 + 0.1 * intensity),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    fn capabilities(&self) -> BackendCapabilities {
        *self.caps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fallback answering every request with a constant decision.
pub struct ConstantFallback(pub Value);

impl FallbackStrategy for ConstantFallback {
    fn name(&self) -> &str {
        "constant"
    }

    fn decide(&self, _features: &Value) -> Value {
        self.0.clone()
    }
}

/// Rollback target that records every restore instead of performing it.
#[derive(Default)]
pub struct RecordingTarget {
    disabled: Mutex<Vec<OptimizationType>>,
    reverted: Mutex<Vec<(OptimizationType, Value)>>,
    metrics: Mutex<Option<PerformanceMetrics>>,
    fail: AtomicBool,
}

impl RecordingTarget {
    /// Optimizations disabled so far.
    pub fn disabled(&self) -> Vec<OptimizationType> {
        self.disabled.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Configurations reverted so far.
    pub fn reverted(&self) -> Vec<(OptimizationType, Value)> {
        self.reverted.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Metrics reported after a restore.
    pub fn set_metrics(&self, metrics: PerformanceMetrics) {
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner) = Some(metrics);
    }

    /// Make every restore fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::Acquire) {
            return Err(ServingError::model("scripted restore failure"));
        }
        Ok(())
    }
}

impl RollbackTarget for RecordingTarget {
    fn disable_optimization(&self, optimization: &OptimizationType) -> Result<()> {
        self.check()?;
        self.disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(optimization.clone());
        Ok(())
    }

    fn revert_config(&self, optimization: &OptimizationType, config: &Value) -> Result<()> {
        self.check()?;
        self.reverted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((optimization.clone(), config.clone()));
        Ok(())
    }

    fn current_metrics(&self) -> Option<PerformanceMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
