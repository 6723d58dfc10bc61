//! # Resource Management
//!
//! Everything the engine needs to decide whether it can afford more work.
//!
//! - **`monitor`**: bounded history of hardware samples.
//! - **`memory_pool`**: the lock-free memory budget and named pools.
//! - **`cache`**: the priority-evicting object cache.
//! - **`gc_scheduler`**: generational collection passes with cooldown.
//! - **`throttle`**: continuous pressure level and graduated mitigations.
//! - **`manager`**: the composition of the above; admission control.

/// Hardware sample history.
pub mod monitor;
/// Memory budget and named pools.
pub mod memory_pool;
/// Priority-evicting object cache.
pub mod cache;
/// Collection scheduling.
pub mod gc_scheduler;
/// Pressure-driven throttling.
pub mod throttle;
/// Admission control.
pub mod manager;

pub use cache::{CachePriority, CacheStats, ObjectCache};
pub use gc_scheduler::{Collector, GcScheduler, GcStats, Generation};
pub use manager::{AllocationGuard, AllocationRecord, ResourceManager, ResourceManagerStats};
pub use memory_pool::{MemoryBudget, MemoryPool, MemoryPoolManager};
pub use monitor::{ResourceMonitor, ResourceSnapshot, ResourceStats};
pub use throttle::{PressureInputs, ThrottleController, ThrottleState};
