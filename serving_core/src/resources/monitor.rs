//! # Resource Monitor
//!
//! Samples the `HardwareProbe` and keeps a bounded history of timestamped
//! snapshots. The resource loop samples on a fixed interval; everything else
//! reads `latest()`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::probe::{HardwareProbe, HardwareSample};

/// A hardware sample stamped with the time it was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// When the probe was read.
    pub timestamp: DateTime<Utc>,
    /// The measurements.
    pub sample: HardwareSample,
}

/// Aggregates over the monitor history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    /// Samples the aggregates cover.
    pub samples: usize,
    /// Mean CPU utilisation.
    pub avg_cpu_percent: f64,
    /// Highest CPU utilisation.
    pub peak_cpu_percent: f64,
    /// Mean process memory.
    pub avg_memory_mb: f64,
    /// Highest process memory.
    pub peak_memory_mb: f64,
    /// Highest thread count.
    pub peak_threads: usize,
}

/// # Resource Monitor
pub struct ResourceMonitor {
    probe: Arc<dyn HardwareProbe>,
    history: Mutex<VecDeque<ResourceSnapshot>>,
    capacity: usize,
}

impl ResourceMonitor {
    /// Create a monitor keeping at most `capacity` snapshots.
    pub fn new(probe: Arc<dyn HardwareProbe>, capacity: usize) -> Self {
        Self {
            probe,
            history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Read the probe, record the snapshot and return it.
    pub fn sample(&self) -> ResourceSnapshot {
        let snapshot = ResourceSnapshot {
            timestamp: Utc::now(),
            sample: self.probe.sample(),
        };
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        snapshot
    }

    /// Most recent snapshot, if any sample was taken yet.
    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    /// Most recent snapshot, sampling the probe if none exists yet.
    pub fn latest_or_sample(&self) -> ResourceSnapshot {
        match self.latest() {
            Some(s) => s,
            None => self.sample(),
        }
    }

    /// Highest GPU memory utilisation among the last `n` samples.
    pub fn recent_peak_gpu_memory(&self, n: usize) -> f64 {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .iter()
            .rev()
            .take(n)
            .map(|s| s.sample.gpu_memory_percent)
            .fold(0.0, f64::max)
    }

    /// Number of retained snapshots.
    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop all but the newest `keep` snapshots, returning how many were dropped.
    pub fn truncate_history(&self, keep: usize) -> usize {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let excess = history.len().saturating_sub(keep);
        history.drain(..excess);
        excess
    }

    /// Aggregates over the retained history.
    pub fn stats(&self) -> ResourceStats {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.is_empty() {
            return ResourceStats::default();
        }
        let n = history.len() as f64;
        ResourceStats {
            samples: history.len(),
            avg_cpu_percent: history.iter().map(|s| s.sample.cpu_percent).sum::<f64>() / n,
            peak_cpu_percent: history.iter().map(|s| s.sample.cpu_percent).fold(0.0, f64::max),
            avg_memory_mb: history.iter().map(|s| s.sample.memory_used_mb).sum::<f64>() / n,
            peak_memory_mb: history.iter().map(|s| s.sample.memory_used_mb).fold(0.0, f64::max),
            peak_threads: history.iter().map(|s| s.sample.thread_count).max().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProbe;

    #[test]
    fn history_is_bounded_and_stats_aggregate() {
        let probe = Arc::new(ScriptedProbe::new(HardwareSample::nominal()));
        let monitor = ResourceMonitor::new(probe.clone(), 3);
        for cpu in [10.0, 20.0, 30.0, 40.0] {
            probe.set(HardwareSample {
                cpu_percent: cpu,
                ..HardwareSample::nominal()
            });
            monitor.sample();
        }
        assert_eq!(monitor.history_len(), 3);
        let stats = monitor.stats();
        assert_eq!(stats.samples, 3);
        assert!((stats.avg_cpu_percent - 30.0).abs() < 1e-9);
        assert_eq!(stats.peak_cpu_percent, 40.0);

        assert_eq!(monitor.truncate_history(1), 2);
        assert_eq!(monitor.latest().map(|s| s.sample.cpu_percent), Some(40.0));
    }
}
