//! # Throttle Controller
//!
//! Turns memory, CPU and thread pressure into one continuous level in `[0, 1]`
//! and derives graduated mitigations from it:
//!
//! - above `delay_threshold` a delay proportional to the level is injected
//!   before admission,
//! - above `reduce_batch_threshold` batch formation is asked to shrink,
//! - above `pause_threshold` non-critical work is deferred.
//!
//! Each resource only contributes once its usage passes `activation_ratio` of
//! its limit, so a host at 50% of every limit runs unthrottled.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::configs::{ResourceLimits, ThrottleConfig};

/// The mitigations currently in force.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleState {
    /// Combined pressure in `[0, 1]`.
    pub level: f64,
    /// Delay to inject before admitting a request.
    pub delay: Duration,
    /// Batch formation should shrink.
    pub reduce_batch: bool,
    /// Non-critical work should be deferred.
    pub pause_non_critical: bool,
}

/// Live usage fed into the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PressureInputs {
    /// Memory in use, in megabytes.
    pub memory_mb: f64,
    /// CPU utilisation in percent.
    pub cpu_percent: f64,
    /// Threads busy on behalf of the engine.
    pub threads: usize,
}

struct ThrottleInner {
    state: ThrottleState,
    last_logged_level: f64,
}

/// # Throttle Controller
pub struct ThrottleController {
    config: ThrottleConfig,
    memory_limit_mb: f64,
    cpu_limit_percent: f64,
    max_threads: usize,
    inner: Mutex<ThrottleInner>,
}

impl ThrottleController {
    /// Create a controller measuring pressure against `limits`.
    pub fn new(config: ThrottleConfig, limits: &ResourceLimits) -> Self {
        Self {
            config,
            memory_limit_mb: limits.memory_limit_mb,
            cpu_limit_percent: limits.cpu_limit_percent,
            max_threads: limits.max_threads,
            inner: Mutex::new(ThrottleInner {
                state: ThrottleState::default(),
                last_logged_level: 0.0,
            }),
        }
    }

    /// How far `usage` is past the activation point of `limit`, scaled to `[0, 1]`.
    pub fn normalized_excess(&self, usage: f64, limit: f64) -> f64 {
        if limit <= 0.0 || usage.is_nan() {
            return 0.0;
        }
        let ratio = usage / limit;
        let activation = self.config.activation_ratio;
        ((ratio - activation) / (1.0 - activation)).clamp(0.0, 1.0)
    }

    /// Recompute the level from `inputs` and store the resulting mitigations.
    pub fn update(&self, inputs: PressureInputs) -> ThrottleState {
        let level = self
            .normalized_excess(inputs.memory_mb, self.memory_limit_mb)
            .max(self.normalized_excess(inputs.cpu_percent, self.cpu_limit_percent))
            .max(self.normalized_excess(inputs.threads as f64, self.max_threads as f64));

        let delay = if level > self.config.delay_threshold {
            Duration::from_secs_f64(self.config.max_delay_ms as f64 * level / 1000.0)
        } else {
            Duration::ZERO
        };
        let state = ThrottleState {
            level,
            delay,
            reduce_batch: level > self.config.reduce_batch_threshold,
            pause_non_critical: level > self.config.pause_threshold,
        };

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if (level - inner.last_logged_level).abs() > self.config.log_delta {
            if level > inner.last_logged_level {
                tracing::warn!(
                    level,
                    reduce_batch = state.reduce_batch,
                    pause_non_critical = state.pause_non_critical,
                    "throttle level rising"
                );
            } else {
                tracing::info!(level, "throttle level easing");
            }
            inner.last_logged_level = level;
        }
        inner.state = state.clone();
        state
    }

    /// The mitigations computed by the last `update`.
    pub fn state(&self) -> ThrottleState {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ThrottleController {
        let limits = ResourceLimits {
            memory_limit_mb: 100.0,
            cpu_limit_percent: 100.0,
            max_threads: 10,
            ..ResourceLimits::default()
        };
        ThrottleController::new(ThrottleConfig::default(), &limits)
    }

    #[test]
    fn quiet_host_is_unthrottled() {
        let t = controller();
        let s = t.update(PressureInputs {
            memory_mb: 50.0,
            cpu_percent: 60.0,
            threads: 2,
        });
        assert_eq!(s.level, 0.0);
        assert_eq!(s.delay, Duration::ZERO);
        assert!(!s.reduce_batch && !s.pause_non_critical);
    }

    #[test]
    fn level_is_the_worst_resource() {
        let t = controller();
        // cpu at 85% of limit -> (0.85 - 0.7) / 0.3 = 0.5
        let s = t.update(PressureInputs {
            memory_mb: 10.0,
            cpu_percent: 85.0,
            threads: 0,
        });
        assert!((s.level - 0.5).abs() < 1e-9);
        assert_eq!(s.delay, Duration::from_millis(5));
        assert!(!s.reduce_batch);

        // threads saturated -> 1.0
        let s = t.update(PressureInputs {
            memory_mb: 10.0,
            cpu_percent: 85.0,
            threads: 10,
        });
        assert_eq!(s.level, 1.0);
        assert!(s.reduce_batch && s.pause_non_critical);
        assert_eq!(t.state(), s);
    }
}
