//! # System Probe
//!
//! Production `HardwareProbe` backed by `sysinfo`. The `System` handle is kept
//! between samples because CPU usage is computed from the delta between two
//! refreshes; the first sample after construction therefore reports 0% CPU.

use std::sync::{Mutex, PoisonError};

use sysinfo::{CpuExt, DiskExt, Pid, ProcessExt, System, SystemExt};

use crate::core::probe::{HardwareProbe, HardwareSample};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// # System Probe
pub struct SystemProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemProbe {
    /// Create a probe for the current process.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_disks_list();
        let pid = sysinfo::get_current_pid().ok();
        Self {
            system: Mutex::new(system),
            pid,
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareProbe for SystemProbe {
    fn sample(&self) -> HardwareSample {
        let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_cpu();
        sys.refresh_memory();
        sys.refresh_disks();

        let total = sys.total_memory() as f64;
        let available = sys.available_memory() as f64;
        let memory_percent = if total > 0.0 {
            ((total - available) / total) * 100.0
        } else {
            0.0
        };

        let memory_used_mb = match self.pid {
            Some(pid) => {
                sys.refresh_process(pid);
                sys.process(pid).map(|p| p.memory() as f64 / BYTES_PER_MB).unwrap_or(0.0)
            }
            None => 0.0,
        };

        let disk_percent = sys
            .disks()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let total = d.total_space() as f64;
                ((total - d.available_space() as f64) / total) * 100.0
            })
            .fold(0.0_f64, f64::max);

        HardwareSample {
            cpu_percent: f64::from(sys.global_cpu_info().cpu_usage()),
            memory_used_mb,
            memory_percent,
            memory_available_gb: available / BYTES_PER_GB,
            gpu_available: false,
            gpu_memory_percent: 0.0,
            disk_percent,
            thread_count: current_thread_count(),
        }
    }
}

/// Threads owned by this process, from `/proc/self/status` where available.
pub fn current_thread_count() -> usize {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_thread_count(&status))
        .unwrap_or(0)
}

fn parse_thread_count(status: &str) -> Option<usize> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_count_is_parsed_from_status() {
        let status = "Name:\tserving\nState:\tR (running)\nThreads:\t17\nVmRSS:\t1024 kB\n";
        assert_eq!(parse_thread_count(status), Some(17));
        assert_eq!(parse_thread_count("Name:\tx\n"), None);
    }

    #[test]
    fn sample_reports_sane_ranges() {
        let probe = SystemProbe::new();
        let s = probe.sample();
        assert!(s.memory_percent >= 0.0 && s.memory_percent <= 100.0);
        assert!(s.disk_percent >= 0.0 && s.disk_percent <= 100.0);
        assert!(s.memory_available_gb >= 0.0);
    }
}
