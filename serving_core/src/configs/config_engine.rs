//! # Engine Configuration Structs
//!
//! Explicit, validated configuration for every subsystem. Each struct carries
//! named fields with defaults and is deserializable from a partial JSON5
//! document, so a file only needs to mention the values it overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, ServingError};

/// # Resource Limits
///
/// The memory/CPU/thread budget the engine is allowed to consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Cumulative memory the engine may grant to operations, in megabytes.
    pub memory_limit_mb: f64,
    /// CPU utilisation considered the ceiling for throttling purposes.
    pub cpu_limit_percent: f64,
    /// Size of the worker pool and the thread budget for admissions.
    pub max_threads: usize,
    /// Interval of the background resource loop.
    pub monitor_interval_ms: u64,
    /// Number of samples kept by the resource monitor.
    pub history_size: usize,
    /// Fraction of `memory_limit_mb` above which aggressive cleanup runs.
    pub emergency_memory_ratio: f64,
    /// Capacity of the object cache in megabytes.
    pub cache_capacity_mb: f64,
    /// Estimated memory footprint of one inference request.
    pub request_memory_mb: f64,
    /// Serve repeated identical payloads from the object cache.
    pub cache_results: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: 200.0,
            cpu_limit_percent: 80.0,
            max_threads: 8,
            monitor_interval_ms: 5_000,
            history_size: 720,
            emergency_memory_ratio: 0.95,
            cache_capacity_mb: 64.0,
            request_memory_mb: 0.5,
            cache_results: false,
        }
    }
}

impl ResourceLimits {
    /// Interval of the resource loop as a `Duration`.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

/// # Collection Scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Memory usage (MB) above which a collection is considered.
    pub threshold_mb: f64,
    /// Minimum time between two non-forced collections.
    pub cooldown_ms: u64,
    /// Multiplier of `threshold_mb` that forces a collection regardless of cooldown.
    pub force_multiplier: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            threshold_mb: 150.0,
            cooldown_ms: 30_000,
            force_multiplier: 1.2,
        }
    }
}

/// # Throttle Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Fraction of a limit at which pressure starts to count.
    pub activation_ratio: f64,
    /// Delay injected at throttle level 1.0.
    pub max_delay_ms: u64,
    /// Level above which a proportional delay is injected.
    pub delay_threshold: f64,
    /// Level above which batch sizes should shrink.
    pub reduce_batch_threshold: f64,
    /// Level above which non-critical work is paused.
    pub pause_threshold: f64,
    /// Minimum level movement before a state change is logged again.
    pub log_delta: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            activation_ratio: 0.7,
            max_delay_ms: 10,
            delay_threshold: 0.3,
            reduce_batch_threshold: 0.6,
            pause_threshold: 0.8,
            log_delta: 0.1,
        }
    }
}

/// # Batching Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Smallest batch the former will build when enough requests wait.
    pub min_batch_size: usize,
    /// Largest batch ever submitted to the backend.
    pub max_batch_size: usize,
    /// Size used while no history exists.
    pub default_batch_size: usize,
    /// Longest a partially filled batch waits for more requests.
    pub max_wait_ms: u64,
    /// Number of batch samples kept for size optimisation.
    pub history_window: usize,
    /// Size change applied by one auto-tuning step.
    pub tuning_step: usize,
    /// Relative throughput drop that triggers a downward tuning step.
    pub trend_drop_ratio: f64,
    /// Capacity of the channel between batch former and executors.
    pub channel_capacity: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: 32,
            default_batch_size: 8,
            max_wait_ms: 5,
            history_window: 50,
            tuning_step: 1,
            trend_drop_ratio: 0.2,
            channel_capacity: 64,
        }
    }
}

impl BatchingConfig {
    /// Maximum batch wait as a `Duration`.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// # Router Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Urgency at or above which the immediate path is mandatory.
    pub urgent_threshold: f64,
    /// Expected single-request backend latency at nominal load.
    pub base_latency_ms: f64,
    /// Per-item cost of a batched call relative to a single call.
    pub batch_efficiency: f64,
    /// Cost charged for consuming the reserved immediate lane.
    pub immediate_lane_penalty_ms: f64,
    /// Worker permits reserved for the immediate path.
    pub reserved_immediate_slots: usize,
    /// Hard timeout around every backend call.
    pub backend_timeout_ms: u64,
    /// Timeout around a training run, which outlasts any prediction.
    pub training_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            urgent_threshold: 0.9,
            base_latency_ms: 4.0,
            batch_efficiency: 0.35,
            immediate_lane_penalty_ms: 3.0,
            reserved_immediate_slots: 2,
            backend_timeout_ms: 2_000,
            training_timeout_ms: 300_000,
        }
    }
}

impl RouterConfig {
    /// Backend hard timeout as a `Duration`.
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// Training timeout as a `Duration`.
    pub fn training_timeout(&self) -> Duration {
        Duration::from_millis(self.training_timeout_ms)
    }
}

/// # Performance Tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Latency target for a single request.
    pub target_latency_ms: f64,
    /// Ratio of target above which a completion is a warning.
    pub warning_ratio: f64,
    /// Ratio of target above which a completion is critical.
    pub critical_ratio: f64,
    /// Samples kept per operation type.
    pub history_size: usize,
    /// Samples needed before a baseline is established.
    pub baseline_min_samples: usize,
    /// Relative change versus baseline that counts as a regression.
    pub regression_threshold: f64,
    /// Samples averaged when comparing against the baseline.
    pub recent_window: usize,
    /// Outcomes considered when computing the recent error rate.
    pub error_window: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            target_latency_ms: 16.0,
            warning_ratio: 1.25,
            critical_ratio: 1.5,
            history_size: 1_000,
            baseline_min_samples: 20,
            regression_threshold: 0.1,
            recent_window: 10,
            error_window: 50,
        }
    }
}

/// # Degradation Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    /// Interval of the periodic degradation check.
    pub check_interval_ms: u64,
    /// Time that must pass after an escalation before recovery is allowed.
    pub stability_period_secs: u64,
    /// Length of the watch that follows a recovery.
    pub stability_watch_secs: u64,
    /// Check interval used while a stability watch is active.
    pub watch_interval_ms: u64,
    /// CPU percentages mapping to Light, Moderate and Heavy.
    pub cpu_thresholds: [f64; 3],
    /// Memory percentages mapping to Light, Moderate and Heavy.
    pub memory_thresholds: [f64; 3],
    /// GPU memory percentage that requires Moderate.
    pub gpu_memory_threshold: f64,
    /// Recent GPU memory percentage above which GPU use is disabled at Moderate.
    pub gpu_disable_threshold: f64,
    /// Disk percentage that requires Critical.
    pub disk_critical_threshold: f64,
    /// Available memory (GB) below which Critical is required.
    pub min_available_memory_gb: f64,
    /// Recent error rate that requires Light.
    pub error_rate_light: f64,
    /// Recent error rate that requires Moderate.
    pub error_rate_moderate: f64,
    /// Number of transitions kept in history.
    pub history_size: usize,
    /// Extra spacing between training runs per unit of reduced training
    /// frequency: at factor `f` runs are `training_interval_ms * (1/f - 1)`
    /// apart.
    pub training_interval_ms: u64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            stability_period_secs: 120,
            stability_watch_secs: 60,
            watch_interval_ms: 1_000,
            cpu_thresholds: [80.0, 90.0, 95.0],
            memory_thresholds: [80.0, 90.0, 95.0],
            gpu_memory_threshold: 90.0,
            gpu_disable_threshold: 85.0,
            disk_critical_threshold: 95.0,
            min_available_memory_gb: 0.5,
            error_rate_light: 0.1,
            error_rate_moderate: 0.25,
            history_size: 100,
            training_interval_ms: 60_000,
        }
    }
}

impl DegradationConfig {
    /// Stability period as a `Duration`.
    pub fn stability_period(&self) -> Duration {
        Duration::from_secs(self.stability_period_secs)
    }

    /// Minimum gap between training runs at training frequency `factor`.
    pub fn training_spacing(&self, factor: f64) -> Duration {
        if factor.is_nan() || factor <= 0.0 {
            return Duration::MAX;
        }
        if factor >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.training_interval_ms).mul_f64(1.0 / factor - 1.0)
    }
}

/// # Rollback Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Directory holding snapshot metadata, history and artifact backups.
    pub storage_dir: PathBuf,
    /// Active snapshots kept before the oldest is evicted.
    pub max_snapshots: usize,
    /// Relative regression versus baseline that flags degradation.
    pub degradation_threshold: f64,
    /// Errors per snapshot at which rollback is flagged.
    pub max_errors: u32,
    /// Stability score; instability is flagged when CV >= 1 - this value.
    pub stability_threshold: f64,
    /// Execute rollbacks immediately when a flag is raised.
    pub auto_rollback: bool,
    /// Latencies kept per snapshot.
    pub window_size: usize,
    /// Interval at which the engine monitors active snapshots.
    pub monitor_interval_ms: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./rollback"),
            max_snapshots: 20,
            degradation_threshold: 0.1,
            max_errors: 5,
            stability_threshold: 0.8,
            auto_rollback: true,
            window_size: 10,
            monitor_interval_ms: 5_000,
        }
    }
}

/// # Logging Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Emit JSON lines on the console instead of human readable text.
    pub json: bool,
    /// Directory for daily rolling log files; console only when absent.
    pub log_dir: Option<PathBuf>,
    /// File name prefix of rolling log files.
    pub file_prefix: String,
    /// Number of log files kept when pruning at start-up.
    pub keep_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_dir: None,
            file_prefix: "serving_core".to_string(),
            keep_files: 5,
        }
    }
}

/// # Engine Configuration
///
/// The root configuration object handed to `ServingEngine::start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Resource budget.
    pub resources: ResourceLimits,
    /// Collection scheduling.
    pub gc: GcConfig,
    /// Throttle behaviour.
    pub throttle: ThrottleConfig,
    /// Batch formation.
    pub batching: BatchingConfig,
    /// Routing cost model.
    pub router: RouterConfig,
    /// Performance targets and baselines.
    pub performance: PerformanceConfig,
    /// Degradation thresholds.
    pub degradation: DegradationConfig,
    /// Rollback safety net.
    pub rollback: RollbackConfig,
    /// Logging setup.
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Reject configurations no component can honour.
    pub fn validate(&self) -> Result<()> {
        let r = &self.resources;
        if r.memory_limit_mb <= 0.0 {
            return Err(ServingError::config("resources.memory_limit_mb must be positive"));
        }
        if r.max_threads == 0 {
            return Err(ServingError::config("resources.max_threads must be at least 1"));
        }
        if !(0.0..=1.0).contains(&r.emergency_memory_ratio) {
            return Err(ServingError::config("resources.emergency_memory_ratio must be within [0, 1]"));
        }

        let b = &self.batching;
        if b.min_batch_size == 0 {
            return Err(ServingError::config("batching.min_batch_size must be at least 1"));
        }
        if b.min_batch_size > b.max_batch_size {
            return Err(ServingError::config("batching.min_batch_size exceeds max_batch_size"));
        }
        if b.default_batch_size < b.min_batch_size || b.default_batch_size > b.max_batch_size {
            return Err(ServingError::config("batching.default_batch_size must lie within [min, max]"));
        }
        if b.tuning_step == 0 || b.channel_capacity == 0 {
            return Err(ServingError::config("batching.tuning_step and channel_capacity must be positive"));
        }

        if self.router.backend_timeout_ms == 0 || self.router.training_timeout_ms == 0 {
            return Err(ServingError::config("router timeouts must be positive"));
        }
        if self.router.reserved_immediate_slots >= r.max_threads && r.max_threads > 1 {
            return Err(ServingError::config(
                "router.reserved_immediate_slots must leave at least one general worker",
            ));
        }

        let t = &self.throttle;
        if !(t.delay_threshold <= t.reduce_batch_threshold && t.reduce_batch_threshold <= t.pause_threshold) {
            return Err(ServingError::config("throttle thresholds must be ascending"));
        }
        if !(0.0..1.0).contains(&t.activation_ratio) {
            return Err(ServingError::config("throttle.activation_ratio must be within [0, 1)"));
        }

        let d = &self.degradation;
        for (name, th) in [("cpu_thresholds", d.cpu_thresholds), ("memory_thresholds", d.memory_thresholds)] {
            if !(th[0] <= th[1] && th[1] <= th[2]) {
                return Err(ServingError::config(format!("degradation.{name} must be ascending")));
            }
        }

        let rb = &self.rollback;
        if !(rb.stability_threshold > 0.0 && rb.stability_threshold < 1.0) {
            return Err(ServingError::config("rollback.stability_threshold must be within (0, 1)"));
        }
        if rb.max_snapshots == 0 || rb.window_size == 0 {
            return Err(ServingError::config("rollback.max_snapshots and window_size must be positive"));
        }

        if self.performance.baseline_min_samples == 0 || self.performance.recent_window == 0 {
            return Err(ServingError::config("performance sample counts must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn inverted_batch_bounds_are_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.batching.min_batch_size = 16;
        cfg.batching.max_batch_size = 4;
        assert!(matches!(cfg.validate(), Err(ServingError::Config(_))));
    }

    #[test]
    fn stability_threshold_must_be_open_interval() {
        let mut cfg = EngineConfig::default();
        cfg.rollback.stability_threshold = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn training_spacing_grows_as_frequency_drops() {
        let d = DegradationConfig {
            training_interval_ms: 1_000,
            ..DegradationConfig::default()
        };
        assert_eq!(d.training_spacing(1.0), Duration::ZERO);
        assert_eq!(d.training_spacing(0.5), Duration::from_millis(1_000));
        assert_eq!(d.training_spacing(0.25), Duration::from_millis(3_000));
        assert_eq!(d.training_spacing(0.0), Duration::MAX);
    }
}
