/// Execution metrics, baselines and regression detection.
pub mod tracker;

pub use tracker::{
    ExecutionMetrics, PerformanceBaseline, PerformanceMetrics, PerformanceSummary, PerformanceTracker,
    RegressionReport, TrackerCollector,
};
