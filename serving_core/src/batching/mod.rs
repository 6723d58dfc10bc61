//! # Batching and Dispatch
//!
//! The request path between admission and the backend.
//!
//! - **`queue`**: four FIFO priority tiers.
//! - **`former`**: batch size optimisation and batch formation.
//! - **`processor`**: batched execution with single-item fallback.
//! - **`router`**: immediate / batched / direct cost comparison.
//! - **`enforcer`**: latency classification and recommendations.
//! - **`worker_pool`**: bounded blocking workers with a reserved lane.

/// Priority tiers.
pub mod queue;
/// Batch formation.
pub mod former;
/// Batch execution.
pub mod processor;
/// Strategy selection.
pub mod router;
/// Latency enforcement.
pub mod enforcer;
/// Blocking worker pool.
pub mod worker_pool;

pub use enforcer::{EnforcerStats, LatencyClass, Recommendation, RealTimePerformanceEnforcer};
pub use former::{Batch, BatchFormer, BatchSample, BatchSizeOptimizer, BatchStatus};
pub use processor::{BatchItem, BatchOutcome, BatchProcessor, ProcessedItem};
pub use queue::PriorityQueueSet;
pub use router::{LoadSnapshot, RouteDecision, Router};
pub use worker_pool::{Lane, WorkerPool, WorkerPoolStats};
