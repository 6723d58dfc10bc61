//! # Feature Policy
//!
//! What each degradation level switches off. Policies are strictly
//! cumulative: the policy of a level is the policy of the level below plus
//! its own changes. Where two levels reduce the same feature, the higher
//! level's (smaller) factor wins.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::degradation::level::DegradationLevel;

/// Batched backend calls.
pub const BATCH_PROCESSING: &str = "batch_processing";
/// Quantized model variants.
pub const QUANTIZATION: &str = "quantization";
/// Quantization decided at run time.
pub const DYNAMIC_QUANTIZATION: &str = "dynamic_quantization";
/// GPU offload.
pub const GPU_ACCELERATION: &str = "gpu_acceleration";
/// Detailed profiling.
pub const PROFILING: &str = "profiling";
/// Coordination across several devices.
pub const MULTI_DEVICE_COORDINATION: &str = "multi_device_coordination";
/// Online training.
pub const MODEL_TRAINING: &str = "model_training";
/// Output quality monitoring.
pub const QUALITY_MONITORING: &str = "quality_monitoring";
/// Hardware-specific tuning.
pub const HARDWARE_OPTIMIZATION: &str = "hardware_optimization";

/// Batch size reduction factor.
pub const BATCH_SIZE: &str = "batch_size";
/// Monitoring frequency reduction factor.
pub const MONITORING_FREQUENCY: &str = "monitoring_frequency";
/// Training intensity reduction factor.
pub const TRAINING_INTENSITY: &str = "training_intensity";
/// Training frequency reduction factor.
pub const TRAINING_FREQUENCY: &str = "training_frequency";

/// Fallback decision strategy active at `Critical`.
pub const RULE_BASED_STRATEGY: &str = "rule_based_strategy";

/// Disabled features, reduction factors and active fallbacks of one level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeaturePolicy {
    /// Features switched off.
    pub disabled: BTreeSet<String>,
    /// Feature name to factor in `(0, 1]`.
    pub reductions: BTreeMap<String, f64>,
    /// Fallback capabilities switched on.
    pub fallbacks: BTreeSet<String>,
}

impl FeaturePolicy {
    fn disable(&mut self, feature: &str) {
        self.disabled.insert(feature.to_string());
    }

    fn reduce(&mut self, feature: &str, factor: f64) {
        let entry = self.reductions.entry(feature.to_string()).or_insert(1.0);
        *entry = entry.min(factor);
    }

    fn activate(&mut self, fallback: &str) {
        self.fallbacks.insert(fallback.to_string());
    }
}

/// # Policy For Level
///
/// The cumulative policy of `level`. GPU use is only disabled at `Moderate`
/// and above when `recent_gpu_memory_percent` exceeds `gpu_disable_threshold`.
pub fn policy_for(level: DegradationLevel, recent_gpu_memory_percent: f64, gpu_disable_threshold: f64) -> FeaturePolicy {
    let mut p = FeaturePolicy::default();
    for step in DegradationLevel::ALL.iter().take(level.index() + 1) {
        match step {
            DegradationLevel::Normal => {}
            DegradationLevel::Light => {
                p.reduce(BATCH_SIZE, 0.75);
                p.reduce(MONITORING_FREQUENCY, 0.5);
            }
            DegradationLevel::Moderate => {
                p.disable(QUANTIZATION);
                p.disable(DYNAMIC_QUANTIZATION);
                if recent_gpu_memory_percent > gpu_disable_threshold {
                    p.disable(GPU_ACCELERATION);
                }
                p.reduce(TRAINING_INTENSITY, 0.5);
                p.reduce(TRAINING_FREQUENCY, 0.5);
            }
            DegradationLevel::Heavy => {
                p.disable(BATCH_PROCESSING);
                p.disable(PROFILING);
                p.disable(MULTI_DEVICE_COORDINATION);
                p.reduce(TRAINING_FREQUENCY, 0.25);
            }
            DegradationLevel::Critical => {
                p.disable(MODEL_TRAINING);
                p.disable(QUALITY_MONITORING);
                p.disable(HARDWARE_OPTIMIZATION);
                p.activate(RULE_BASED_STRATEGY);
            }
        }
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_are_cumulative() {
        let mut previous = policy_for(DegradationLevel::Normal, 0.0, 85.0);
        assert!(previous.disabled.is_empty() && previous.reductions.is_empty());
        for level in &DegradationLevel::ALL[1..] {
            let p = policy_for(*level, 0.0, 85.0);
            assert!(p.disabled.is_superset(&previous.disabled), "{level}");
            assert!(p.fallbacks.is_superset(&previous.fallbacks), "{level}");
            for (name, factor) in &previous.reductions {
                assert!(p.reductions.get(name).copied().unwrap_or(1.0) <= *factor);
            }
            previous = p;
        }
        assert!(previous.fallbacks.contains(RULE_BASED_STRATEGY));
        assert_eq!(previous.reductions.get(TRAINING_FREQUENCY), Some(&0.25));
    }

    #[test]
    fn gpu_is_only_disabled_under_gpu_memory_pressure() {
        assert!(!policy_for(DegradationLevel::Moderate, 50.0, 85.0)
            .disabled
            .contains(GPU_ACCELERATION));
        assert!(policy_for(DegradationLevel::Moderate, 90.0, 85.0)
            .disabled
            .contains(GPU_ACCELERATION));
        assert!(!policy_for(DegradationLevel::Light, 99.0, 85.0)
            .disabled
            .contains(GPU_ACCELERATION));
    }
}
