//! # Real-Time Performance Enforcer
//!
//! Classifies every completion against the latency target and turns slow
//! completions into recommendations. The enforcer never changes state itself;
//! its recommendations are queued on the `PerformanceTracker` and acted upon by
//! the engine's maintenance loop.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::configs::PerformanceConfig;

/// Latency class of one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyClass {
    /// At or below `warning_ratio * target`.
    WithinTarget,
    /// Above `warning_ratio * target`.
    Warning,
    /// Above `critical_ratio * target`.
    Critical,
}

/// What the engine should consider doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recommendation {
    /// Shrink the batch target by one step.
    ReduceBatchSize,
    /// Run a degradation evaluation now instead of at the next tick.
    CheckDegradation,
}

/// Counters of the enforcer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnforcerStats {
    /// Completions within target.
    pub within_target: u64,
    /// Warning completions.
    pub warnings: u64,
    /// Critical completions.
    pub critical: u64,
    /// Fraction of completions within target.
    pub compliance_rate: f64,
}

/// # Real-Time Performance Enforcer
#[derive(Debug)]
pub struct RealTimePerformanceEnforcer {
    target_ms: f64,
    warning_ratio: f64,
    critical_ratio: f64,
    within: AtomicU64,
    warnings: AtomicU64,
    critical: AtomicU64,
}

impl RealTimePerformanceEnforcer {
    /// Enforcer for the target in `config`.
    pub fn new(config: &PerformanceConfig) -> Self {
        Self {
            target_ms: config.target_latency_ms,
            warning_ratio: config.warning_ratio,
            critical_ratio: config.critical_ratio,
            within: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
            critical: AtomicU64::new(0),
        }
    }

    /// Classify without counting.
    pub fn classify(&self, elapsed_ms: f64) -> LatencyClass {
        if elapsed_ms > self.target_ms * self.critical_ratio {
            LatencyClass::Critical
        } else if elapsed_ms > self.target_ms * self.warning_ratio {
            LatencyClass::Warning
        } else {
            LatencyClass::WithinTarget
        }
    }

    /// Classify and count one completion, returning its recommendations.
    pub fn check(&self, elapsed_ms: f64) -> (LatencyClass, Vec<Recommendation>) {
        let class = self.classify(elapsed_ms);
        let recs = match class {
            LatencyClass::WithinTarget => {
                self.within.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
            LatencyClass::Warning => {
                self.warnings.fetch_add(1, Ordering::Relaxed);
                vec![Recommendation::ReduceBatchSize]
            }
            LatencyClass::Critical => {
                self.critical.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(elapsed_ms, target_ms = self.target_ms, "critical latency");
                vec![Recommendation::ReduceBatchSize, Recommendation::CheckDegradation]
            }
        };
        (class, recs)
    }

    /// Counters.
    pub fn stats(&self) -> EnforcerStats {
        let within = self.within.load(Ordering::Relaxed);
        let warnings = self.warnings.load(Ordering::Relaxed);
        let critical = self.critical.load(Ordering::Relaxed);
        let total = within + warnings + critical;
        EnforcerStats {
            within_target: within,
            warnings,
            critical,
            compliance_rate: if total == 0 { 1.0 } else { within as f64 / total as f64 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_are_classified_against_target() {
        let e = RealTimePerformanceEnforcer::new(&PerformanceConfig::default());
        // target 16ms: warning above 20ms, critical above 24ms
        assert_eq!(e.check(10.0).0, LatencyClass::WithinTarget);
        assert_eq!(e.check(20.0).0, LatencyClass::WithinTarget);
        let (class, recs) = e.check(22.0);
        assert_eq!(class, LatencyClass::Warning);
        assert_eq!(recs, vec![Recommendation::ReduceBatchSize]);
        let (class, recs) = e.check(30.0);
        assert_eq!(class, LatencyClass::Critical);
        assert!(recs.contains(&Recommendation::CheckDegradation));

        let stats = e.stats();
        assert_eq!(stats.within_target, 2);
        assert!((stats.compliance_rate - 0.5).abs() < 1e-9);
    }
}
