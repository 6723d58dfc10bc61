//! # Performance Tracker
//!
//! Records execution metrics per operation type, establishes a baseline once
//! enough samples exist, and flags regressions of the recent window against
//! it. It also keeps the global success/failure window the degradation
//! controller reads, and the queue of recommendations the enforcer emits.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batching::enforcer::Recommendation;
use crate::configs::PerformanceConfig;
use crate::resources::gc_scheduler::{Collector, Generation};
use crate::utils::stats;

const MAX_PENDING_RECOMMENDATIONS: usize = 256;

/// One observed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Operation type, e.g. `inference` or `training`.
    pub operation: String,
    /// End-to-end latency.
    pub latency_ms: f64,
    /// Items per second achieved by this execution.
    pub throughput: Option<f64>,
    /// Memory attributed to the execution.
    pub memory_mb: Option<f64>,
    /// Accuracy, when the backend reports one.
    pub accuracy: Option<f64>,
    /// Training time, for training runs.
    pub training_time_ms: Option<f64>,
    /// Whether the execution produced a result.
    pub success: bool,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
}

impl ExecutionMetrics {
    /// A successful execution of `operation` taking `latency_ms`.
    pub fn success(operation: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            operation: operation.into(),
            latency_ms,
            throughput: (latency_ms > 0.0).then(|| 1000.0 / latency_ms),
            memory_mb: None,
            accuracy: None,
            training_time_ms: None,
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// A failed execution of `operation` after `latency_ms`.
    pub fn failure(operation: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            success: false,
            throughput: None,
            ..Self::success(operation, latency_ms)
        }
    }
}

/// Aggregate metrics of a window, the unit compared against baselines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Mean latency.
    pub latency_ms: f64,
    /// Mean items per second.
    pub throughput: f64,
    /// Mean memory, 0 when unknown.
    pub memory_mb: f64,
    /// Mean accuracy, when reported.
    pub accuracy: Option<f64>,
    /// Mean training time, when reported.
    pub training_time_ms: Option<f64>,
}

/// # Performance Baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    /// Operation type.
    pub operation: String,
    /// Baseline metrics.
    pub metrics: PerformanceMetrics,
    /// Samples the baseline was computed from.
    pub sample_count: usize,
    /// When it was measured.
    pub measured_at: DateTime<Utc>,
}

/// One metric that moved past the regression threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionReport {
    /// Operation type.
    pub operation: String,
    /// Metric name.
    pub metric: String,
    /// Baseline value.
    pub baseline: f64,
    /// Current value.
    pub current: f64,
    /// Relative change in the bad direction.
    pub change_ratio: f64,
}

/// Latency distribution and error rate of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    /// Operation type.
    pub operation: String,
    /// Samples in history.
    pub samples: usize,
    /// Mean latency of successful executions.
    pub mean_latency_ms: f64,
    /// Median latency.
    pub p50_latency_ms: f64,
    /// 95th percentile latency.
    pub p95_latency_ms: f64,
    /// 99th percentile latency.
    pub p99_latency_ms: f64,
    /// Executions per second over the history span.
    pub requests_per_sec: f64,
    /// Failed fraction of the history.
    pub error_rate: f64,
    /// Baseline, when established.
    pub baseline: Option<PerformanceBaseline>,
}

/// # Performance Tracker
pub struct PerformanceTracker {
    config: PerformanceConfig,
    history: Mutex<HashMap<String, VecDeque<ExecutionMetrics>>>,
    baselines: Mutex<HashMap<String, PerformanceBaseline>>,
    outcomes: Mutex<VecDeque<bool>>,
    recommendations: Mutex<VecDeque<Recommendation>>,
}

impl PerformanceTracker {
    /// Tracker with empty history.
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
            baselines: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(VecDeque::new()),
            recommendations: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one execution. Returns the regressions it revealed, if any.
    pub fn record(&self, metrics: ExecutionMetrics) -> Vec<RegressionReport> {
        {
            let mut outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
            if outcomes.len() == self.config.error_window.max(1) {
                outcomes.pop_front();
            }
            outcomes.push_back(metrics.success);
        }

        let operation = metrics.operation.clone();
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            let series = history.entry(operation.clone()).or_default();
            if series.len() == self.config.history_size.max(1) {
                series.pop_front();
            }
            series.push_back(metrics);
        }

        let has_baseline = self
            .baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&operation);
        if !has_baseline {
            self.try_establish_baseline(&operation);
            return Vec::new();
        }
        let reports = self.detect_regressions(&operation);
        for r in &reports {
            tracing::debug!(
                operation = %r.operation,
                metric = %r.metric,
                baseline = r.baseline,
                current = r.current,
                "performance regression"
            );
        }
        reports
    }

    fn try_establish_baseline(&self, operation: &str) -> Option<PerformanceBaseline> {
        let (metrics, count) = {
            let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            let series = history.get(operation)?;
            let ok: Vec<&ExecutionMetrics> = series.iter().filter(|m| m.success).collect();
            if ok.len() < self.config.baseline_min_samples {
                return None;
            }
            (Self::aggregate(ok.iter().copied()), ok.len())
        };
        let baseline = PerformanceBaseline {
            operation: operation.to_string(),
            metrics,
            sample_count: count,
            measured_at: Utc::now(),
        };
        tracing::info!(
            operation,
            latency_ms = baseline.metrics.latency_ms,
            samples = count,
            "performance baseline established"
        );
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation.to_string(), baseline.clone());
        Some(baseline)
    }

    /// Drop the baseline of `operation` and re-establish it from the current
    /// history when possible.
    pub fn reset_baseline(&self, operation: &str) -> Option<PerformanceBaseline> {
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(operation);
        self.try_establish_baseline(operation)
    }

    /// The baseline of `operation`.
    pub fn baseline(&self, operation: &str) -> Option<PerformanceBaseline> {
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .cloned()
    }

    /// Aggregate of the most recent `recent_window` successful executions.
    pub fn current_metrics(&self, operation: &str) -> Option<PerformanceMetrics> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let series = history.get(operation)?;
        let recent: Vec<&ExecutionMetrics> = series
            .iter()
            .rev()
            .filter(|m| m.success)
            .take(self.config.recent_window)
            .collect();
        if recent.is_empty() {
            return None;
        }
        Some(Self::aggregate(recent.into_iter()))
    }

    /// Regressions of the recent window against the baseline.
    pub fn detect_regressions(&self, operation: &str) -> Vec<RegressionReport> {
        let Some(baseline) = self.baseline(operation) else {
            return Vec::new();
        };
        let Some(current) = self.current_metrics(operation) else {
            return Vec::new();
        };
        let threshold = self.config.regression_threshold;
        let mut out = Vec::new();
        let mut check = |metric: &str, base: f64, now: f64, higher_is_worse: bool| {
            if base <= 0.0 {
                return;
            }
            let change = if higher_is_worse { (now - base) / base } else { (base - now) / base };
            if change > threshold {
                out.push(RegressionReport {
                    operation: operation.to_string(),
                    metric: metric.to_string(),
                    baseline: base,
                    current: now,
                    change_ratio: change,
                });
            }
        };
        check("latency_ms", baseline.metrics.latency_ms, current.latency_ms, true);
        check("throughput", baseline.metrics.throughput, current.throughput, false);
        if let (Some(b), Some(c)) = (baseline.metrics.accuracy, current.accuracy) {
            check("accuracy", b, c, false);
        }
        if let (Some(b), Some(c)) = (baseline.metrics.training_time_ms, current.training_time_ms) {
            check("training_time_ms", b, c, true);
        }
        out
    }

    /// Whether `operation` currently regresses against its baseline.
    pub fn has_regression(&self, operation: &str) -> bool {
        !self.detect_regressions(operation).is_empty()
    }

    /// Failed fraction of the last `error_window` executions of any type.
    pub fn recent_error_rate(&self) -> f64 {
        let outcomes = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        if outcomes.is_empty() {
            return 0.0;
        }
        outcomes.iter().filter(|ok| !**ok).count() as f64 / outcomes.len() as f64
    }

    /// Queue a recommendation for the maintenance loop.
    pub fn push_recommendation(&self, rec: Recommendation) {
        let mut q = self.recommendations.lock().unwrap_or_else(PoisonError::into_inner);
        if q.len() == MAX_PENDING_RECOMMENDATIONS {
            q.pop_front();
        }
        q.push_back(rec);
    }

    /// Take every queued recommendation, collapsing duplicates.
    pub fn drain_recommendations(&self) -> Vec<Recommendation> {
        let mut q = self.recommendations.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Recommendation> = Vec::new();
        for rec in q.drain(..) {
            if !out.contains(&rec) {
                out.push(rec);
            }
        }
        out
    }

    /// Distribution summary of `operation`.
    pub fn summary(&self, operation: &str) -> Option<PerformanceSummary> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let series = history.get(operation)?;
        if series.is_empty() {
            return None;
        }
        let latencies: Vec<f64> = series.iter().filter(|m| m.success).map(|m| m.latency_ms).collect();
        let failures = series.iter().filter(|m| !m.success).count();
        let span_secs = match (series.front(), series.back()) {
            (Some(a), Some(b)) => (b.timestamp - a.timestamp).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };
        let summary = PerformanceSummary {
            operation: operation.to_string(),
            samples: series.len(),
            mean_latency_ms: stats::mean(&latencies).unwrap_or(0.0),
            p50_latency_ms: stats::percentile(&latencies, 50.0).unwrap_or(0.0),
            p95_latency_ms: stats::percentile(&latencies, 95.0).unwrap_or(0.0),
            p99_latency_ms: stats::percentile(&latencies, 99.0).unwrap_or(0.0),
            requests_per_sec: if span_secs > 0.0 { series.len() as f64 / span_secs } else { 0.0 },
            error_rate: failures as f64 / series.len() as f64,
            baseline: None,
        };
        drop(history);
        Some(PerformanceSummary {
            baseline: self.baseline(operation),
            ..summary
        })
    }

    /// Operation types with history.
    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ops.sort();
        ops
    }

    /// Keep only the newest `keep` samples per operation.
    pub fn truncate_history(&self, keep: usize) -> usize {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = 0;
        for series in history.values_mut() {
            let excess = series.len().saturating_sub(keep);
            series.drain(..excess);
            dropped += excess;
        }
        dropped
    }

    fn aggregate<'a>(samples: impl Iterator<Item = &'a ExecutionMetrics>) -> PerformanceMetrics {
        let samples: Vec<&ExecutionMetrics> = samples.collect();
        let lat: Vec<f64> = samples.iter().map(|m| m.latency_ms).collect();
        let thr: Vec<f64> = samples.iter().filter_map(|m| m.throughput).collect();
        let mem: Vec<f64> = samples.iter().filter_map(|m| m.memory_mb).collect();
        let acc: Vec<f64> = samples.iter().filter_map(|m| m.accuracy).collect();
        let train: Vec<f64> = samples.iter().filter_map(|m| m.training_time_ms).collect();
        PerformanceMetrics {
            latency_ms: stats::mean(&lat).unwrap_or(0.0),
            throughput: stats::mean(&thr).unwrap_or(0.0),
            memory_mb: stats::mean(&mem).unwrap_or(0.0),
            accuracy: stats::mean(&acc),
            training_time_ms: stats::mean(&train),
        }
    }
}

/// Old-generation collector trimming tracker history to a quarter.
pub struct TrackerCollector {
    tracker: Arc<PerformanceTracker>,
    keep: usize,
}

impl TrackerCollector {
    /// Collector for `tracker`.
    pub fn new(tracker: Arc<PerformanceTracker>) -> Self {
        let keep = (tracker.config.history_size / 4).max(tracker.config.recent_window);
        Self { tracker, keep }
    }
}

impl Collector for TrackerCollector {
    fn name(&self) -> &str {
        "performance_history"
    }

    fn collect(&self, generation: Generation) -> usize {
        match generation {
            Generation::Old => self.tracker.truncate_history(self.keep),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PerformanceTracker {
        PerformanceTracker::new(PerformanceConfig {
            baseline_min_samples: 5,
            recent_window: 5,
            ..PerformanceConfig::default()
        })
    }

    #[test]
    fn baseline_then_regression() {
        let t = tracker();
        for _ in 0..5 {
            assert!(t.record(ExecutionMetrics::success("inference", 10.0)).is_empty());
        }
        let baseline = t.baseline("inference").expect("baseline after 5 samples");
        assert!((baseline.metrics.latency_ms - 10.0).abs() < 1e-9);

        let mut reports = Vec::new();
        for _ in 0..5 {
            reports = t.record(ExecutionMetrics::success("inference", 20.0));
        }
        assert!(reports.iter().any(|r| r.metric == "latency_ms"));
        assert!(reports.iter().any(|r| r.metric == "throughput"));
        assert!(t.has_regression("inference"));
    }

    #[test]
    fn error_rate_covers_recent_outcomes() {
        let t = tracker();
        for i in 0..10 {
            if i % 5 == 0 {
                t.record(ExecutionMetrics::failure("inference", 1.0));
            } else {
                t.record(ExecutionMetrics::success("inference", 1.0));
            }
        }
        assert!((t.recent_error_rate() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn summary_and_recommendations() {
        let t = tracker();
        for ms in 1..=100 {
            t.record(ExecutionMetrics::success("inference", ms as f64));
        }
        let s = t.summary("inference").expect("summary");
        assert_eq!(s.samples, 100);
        assert_eq!(s.p99_latency_ms, 99.0);
        assert!(s.baseline.is_some());

        t.push_recommendation(Recommendation::ReduceBatchSize);
        t.push_recommendation(Recommendation::ReduceBatchSize);
        t.push_recommendation(Recommendation::CheckDegradation);
        assert_eq!(t.drain_recommendations().len(), 2);
        assert!(t.drain_recommendations().is_empty());

        assert_eq!(t.truncate_history(10), 90);
    }
}
