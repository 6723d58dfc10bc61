//! Degradation levels and the service modes they map to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// System-wide severity, ordered from healthy to emergency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum DegradationLevel {
    /// Everything enabled.
    #[default]
    Normal = 0,
    /// Smaller batches, less monitoring.
    Light = 1,
    /// Quantization off, lighter training.
    Moderate = 2,
    /// No batching, no profiling.
    Heavy = 3,
    /// No training, rule-based fallback.
    Critical = 4,
}

/// Service mode, one per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceMode {
    /// `Normal`.
    FullPerformance,
    /// `Light`.
    Optimized,
    /// `Moderate`.
    Reduced,
    /// `Heavy`.
    Minimal,
    /// `Critical`.
    Emergency,
}

impl DegradationLevel {
    /// Every level, ascending.
    pub const ALL: [DegradationLevel; 5] = [
        DegradationLevel::Normal,
        DegradationLevel::Light,
        DegradationLevel::Moderate,
        DegradationLevel::Heavy,
        DegradationLevel::Critical,
    ];

    /// Numeric severity.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The matching service mode.
    pub fn mode(self) -> ServiceMode {
        match self {
            DegradationLevel::Normal => ServiceMode::FullPerformance,
            DegradationLevel::Light => ServiceMode::Optimized,
            DegradationLevel::Moderate => ServiceMode::Reduced,
            DegradationLevel::Heavy => ServiceMode::Minimal,
            DegradationLevel::Critical => ServiceMode::Emergency,
        }
    }

    /// One level up, saturating at `Critical`.
    pub fn escalated(self) -> Self {
        Self::ALL[(self.index() + 1).min(4)]
    }

    /// One level down, saturating at `Normal`.
    pub fn relaxed(self) -> Self {
        Self::ALL[self.index().saturating_sub(1)]
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DegradationLevel::Normal => "normal",
            DegradationLevel::Light => "light",
            DegradationLevel::Moderate => "moderate",
            DegradationLevel::Heavy => "heavy",
            DegradationLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}
