//! # Hardware Probe
//!
//! The on-demand source of host measurements. `utils::sys_info::SystemProbe`
//! is the production implementation; tests script their own.

use serde::{Deserialize, Serialize};

/// One measurement of the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareSample {
    /// Global CPU utilisation in percent.
    pub cpu_percent: f64,
    /// Memory used by this process, in megabytes.
    pub memory_used_mb: f64,
    /// System memory utilisation in percent.
    pub memory_percent: f64,
    /// Memory still available on the host, in gigabytes.
    pub memory_available_gb: f64,
    /// Whether a GPU is present.
    pub gpu_available: bool,
    /// GPU memory utilisation in percent (0 without a GPU).
    pub gpu_memory_percent: f64,
    /// Utilisation of the fullest disk in percent.
    pub disk_percent: f64,
    /// Threads owned by this process.
    pub thread_count: usize,
}

impl HardwareSample {
    /// A quiet host: useful as a baseline in tests and before the first sample.
    pub fn nominal() -> Self {
        Self {
            cpu_percent: 10.0,
            memory_used_mb: 50.0,
            memory_percent: 30.0,
            memory_available_gb: 8.0,
            gpu_available: false,
            gpu_memory_percent: 0.0,
            disk_percent: 40.0,
            thread_count: 8,
        }
    }
}

/// Source of `HardwareSample`s.
pub trait HardwareProbe: Send + Sync + 'static {
    /// Take one sample now.
    fn sample(&self) -> HardwareSample;
}
