//! # Resource Manager
//!
//! Admission control for the whole engine. It composes the monitor, the shared
//! memory budget with its named pools, the object cache, the collection
//! scheduler and the throttle controller, and answers one question for every
//! operation: may it have this much memory right now?
//!
//! ## Core Functionality:
//!
//! - **Admission**: `allocate_for_operation` reserves against the budget. When
//!   the budget is short it runs one optimization pass (young collection plus
//!   cache optimisation) and tries once more before failing with
//!   `ResourceExhausted`. A grant is an `AllocationGuard` that returns its
//!   memory and threads when dropped.
//!
//! - **Cache Accounting**: the object cache draws from the same budget as
//!   operations and pools, so evicting cache entries is what the optimization
//!   pass actually frees.
//!
//! - **Background Loop**: `run` samples the host, lets the collection
//!   scheduler decide whether to sweep, refreshes the throttle and, past the
//!   emergency ratio, performs an aggressive cleanup. The sampling period
//!   stretches while monitoring frequency is reduced.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::configs::{GcConfig, ResourceLimits, ThrottleConfig};
use crate::core::probe::HardwareProbe;
use crate::errors::{Result, ServingError};
use crate::resources::cache::{CachePriority, CacheStats, ObjectCache};
use crate::resources::gc_scheduler::{Collector, GcScheduler, GcStats, Generation};
use crate::resources::memory_pool::{MemoryBudget, MemoryPool, MemoryPoolManager};
use crate::resources::monitor::{ResourceMonitor, ResourceSnapshot, ResourceStats};
use crate::resources::throttle::{PressureInputs, ThrottleController, ThrottleState};

/// One outstanding grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Grant id.
    pub id: u64,
    /// Operation type that asked for it.
    pub operation: String,
    /// Granted memory.
    pub memory_mb: f64,
    /// Granted threads.
    pub threads: usize,
    /// When it was granted.
    pub granted_at: DateTime<Utc>,
}

#[derive(Default)]
struct Ledger {
    records: Mutex<HashMap<u64, AllocationRecord>>,
    threads: AtomicUsize,
}

/// # Allocation Guard
///
/// Proof of an admitted operation. Dropping it returns the memory to the
/// budget and removes the record from the ledger.
#[must_use = "the allocation is released as soon as the guard is dropped"]
pub struct AllocationGuard {
    id: u64,
    memory_mb: f64,
    threads: usize,
    budget: Arc<MemoryBudget>,
    ledger: Arc<Ledger>,
}

impl AllocationGuard {
    /// Grant id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Granted memory in megabytes.
    pub fn memory_mb(&self) -> f64 {
        self.memory_mb
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        self.budget.release(self.memory_mb);
        self.ledger.threads.fetch_sub(self.threads, Ordering::AcqRel);
        self.ledger
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Point-in-time view of every resource subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceManagerStats {
    /// Budget capacity.
    pub memory_limit_mb: f64,
    /// Memory reserved by operations, pools and cache.
    pub reserved_mb: f64,
    /// Remaining headroom.
    pub available_mb: f64,
    /// Memory held by named pools.
    pub pooled_mb: f64,
    /// Outstanding operation grants.
    pub active_allocations: usize,
    /// Threads held by outstanding grants.
    pub granted_threads: usize,
    /// Grants refused since start.
    pub denied_allocations: u64,
    /// Current throttle mitigations.
    pub throttle: ThrottleState,
    /// Collection counters.
    pub gc: GcStats,
    /// Cache counters.
    pub cache: CacheStats,
    /// Monitor aggregates.
    pub monitor: ResourceStats,
}

struct CacheCollector {
    cache: Arc<ObjectCache<Value>>,
}

impl Collector for CacheCollector {
    fn name(&self) -> &str {
        "object_cache"
    }

    fn collect(&self, generation: Generation) -> usize {
        match generation {
            Generation::Young => self.cache.collect_unused(),
            Generation::Mature => self.cache.optimize(),
            Generation::Old => self.cache.force_evict_quartile(),
        }
    }
}

struct MonitorCollector {
    monitor: Arc<ResourceMonitor>,
    keep: usize,
}

impl Collector for MonitorCollector {
    fn name(&self) -> &str {
        "resource_history"
    }

    fn collect(&self, generation: Generation) -> usize {
        match generation {
            Generation::Old => self.monitor.truncate_history(self.keep),
            _ => 0,
        }
    }
}

/// # Resource Manager
pub struct ResourceManager {
    limits: ResourceLimits,
    monitor: Arc<ResourceMonitor>,
    budget: Arc<MemoryBudget>,
    pools: MemoryPoolManager,
    cache: Arc<ObjectCache<Value>>,
    cache_accounted_mb: Mutex<f64>,
    gc: GcScheduler,
    throttle: ThrottleController,
    ledger: Arc<Ledger>,
    workers: OnceLock<Arc<AtomicUsize>>,
    rss_baseline_mb: OnceLock<f64>,
    next_id: AtomicU64,
    denied: AtomicU64,
}

impl ResourceManager {
    /// Build the manager and register the built-in collectors.
    pub fn new(
        limits: ResourceLimits,
        gc: GcConfig,
        throttle: ThrottleConfig,
        probe: Arc<dyn HardwareProbe>,
    ) -> Self {
        let monitor = Arc::new(ResourceMonitor::new(probe, limits.history_size));
        let budget = Arc::new(MemoryBudget::new(limits.memory_limit_mb));
        let cache = Arc::new(ObjectCache::new(
            limits.cache_capacity_mb,
            limits.monitor_interval(),
        ));
        let gc = GcScheduler::new(gc);
        gc.register(Arc::new(CacheCollector { cache: Arc::clone(&cache) }));
        gc.register(Arc::new(MonitorCollector {
            monitor: Arc::clone(&monitor),
            keep: (limits.history_size / 4).max(1),
        }));
        Self {
            throttle: ThrottleController::new(throttle, &limits),
            pools: MemoryPoolManager::new(Arc::clone(&budget)),
            limits,
            monitor,
            budget,
            cache,
            cache_accounted_mb: Mutex::new(0.0),
            gc,
            ledger: Arc::new(Ledger::default()),
            workers: OnceLock::new(),
            rss_baseline_mb: OnceLock::new(),
            next_id: AtomicU64::new(1),
            denied: AtomicU64::new(0),
        }
    }

    /// # Allocate for Operation
    ///
    /// Grant `memory_mb` and `threads` to one operation of type `operation`.
    /// Fails with `ResourceExhausted` when the budget is still short after one
    /// optimization pass.
    pub fn allocate_for_operation(&self, operation: &str, memory_mb: f64, threads: usize) -> Result<AllocationGuard> {
        if memory_mb.is_nan() || memory_mb < 0.0 {
            return Err(ServingError::validation(format!(
                "memory estimate for '{operation}' must be non-negative"
            )));
        }
        if !self.budget.try_reserve(memory_mb) {
            let freed = self.optimize_for(memory_mb);
            tracing::debug!(operation, memory_mb, freed, "admission retry after optimization pass");
            if !self.budget.try_reserve(memory_mb) {
                self.denied.fetch_add(1, Ordering::Relaxed);
                let available_mb = self.budget.available_mb();
                tracing::warn!(operation, memory_mb, available_mb, "allocation denied");
                return Err(ServingError::ResourceExhausted {
                    operation: operation.to_string(),
                    requested_mb: memory_mb,
                    available_mb,
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.ledger.threads.fetch_add(threads, Ordering::AcqRel);
        self.ledger
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                AllocationRecord {
                    id,
                    operation: operation.to_string(),
                    memory_mb,
                    threads,
                    granted_at: Utc::now(),
                },
            );
        Ok(AllocationGuard {
            id,
            memory_mb,
            threads,
            budget: Arc::clone(&self.budget),
            ledger: Arc::clone(&self.ledger),
        })
    }

    /// Count the calls running on a worker pool as threads in use. Only the
    /// first gauge attached is kept.
    pub fn attach_worker_gauge(&self, busy: Arc<AtomicUsize>) {
        if self.workers.set(busy).is_err() {
            tracing::debug!("worker gauge already attached");
        }
    }

    /// Threads held by grants plus calls running on the attached pool.
    pub fn threads_in_use(&self) -> usize {
        let busy = self.workers.get().map_or(0, |g| g.load(Ordering::Acquire));
        self.ledger.threads.load(Ordering::Acquire) + busy
    }

    /// Create a named pool out of the shared budget.
    pub fn allocate_pool(&self, name: &str, size_mb: f64) -> bool {
        self.pools.allocate_pool(name, size_mb)
    }

    /// Release a named pool.
    pub fn release_pool(&self, name: &str) -> bool {
        self.pools.release_pool(name)
    }

    /// Snapshot of all pools.
    pub fn pools(&self) -> Vec<MemoryPool> {
        self.pools.pools()
    }

    /// Cache `value` under `key`, charging `size_mb` to the budget.
    pub fn cache_put(&self, key: &str, value: Value, size_mb: f64, priority: CachePriority) -> bool {
        let stored = self.cache.put(key, value, size_mb, priority);
        self.sync_cache_accounting();
        stored
    }

    /// Look up a cached value.
    pub fn cache_get(&self, key: &str) -> Option<Value> {
        self.cache.get(key)
    }

    /// Add a collector to every subsequent collection pass.
    pub fn register_collector(&self, collector: Arc<dyn Collector>) {
        self.gc.register(collector);
    }

    /// One optimization pass: young collection plus cache optimisation.
    /// Returns the number of objects released.
    pub fn optimize(&self) -> usize {
        let freed = self.gc.collect(false) + self.cache.optimize();
        self.sync_cache_accounting();
        freed
    }

    /// Aggressive collection, forced cache eviction and history truncation.
    pub fn aggressive_cleanup(&self) -> usize {
        let freed = self.gc.collect(true) + self.cache.force_evict_quartile();
        self.sync_cache_accounting();
        tracing::warn!(
            freed,
            reserved_mb = self.budget.reserved_mb(),
            "aggressive cleanup performed"
        );
        freed
    }

    /// Memory considered for pressure decisions: the larger of the budget's
    /// reservations and the growth of the process footprint since the first
    /// sample. The footprint the process started with (runtime, model
    /// weights) is not part of the budget.
    pub fn memory_in_use_mb(&self, snapshot: &ResourceSnapshot) -> f64 {
        let rss = snapshot.sample.memory_used_mb;
        let baseline = *self.rss_baseline_mb.get_or_init(|| rss);
        self.budget.reserved_mb().max((rss - baseline).max(0.0))
    }

    /// Process footprint recorded at the first sample.
    pub fn rss_baseline_mb(&self) -> Option<f64> {
        self.rss_baseline_mb.get().copied()
    }

    /// # Tick
    ///
    /// One iteration of the background loop: sample, collection check,
    /// throttle refresh, emergency cleanup.
    pub fn tick(&self) -> ThrottleState {
        let snapshot = self.monitor.sample();
        let memory_mb = self.memory_in_use_mb(&snapshot);

        if self.gc.should_collect(memory_mb) {
            let aggressive = memory_mb > self.limits.memory_limit_mb * self.limits.emergency_memory_ratio;
            self.gc.collect(aggressive);
            self.sync_cache_accounting();
        }

        let state = self.refresh_throttle_with(&snapshot);

        if memory_mb >= self.limits.memory_limit_mb * self.limits.emergency_memory_ratio {
            self.aggressive_cleanup();
        }
        state
    }

    /// Recompute the throttle from the latest sample.
    pub fn refresh_throttle(&self) -> ThrottleState {
        let snapshot = self.monitor.latest_or_sample();
        self.refresh_throttle_with(&snapshot)
    }

    fn refresh_throttle_with(&self, snapshot: &ResourceSnapshot) -> ThrottleState {
        self.throttle.update(PressureInputs {
            memory_mb: self.memory_in_use_mb(snapshot),
            cpu_percent: snapshot.sample.cpu_percent,
            threads: self.threads_in_use(),
        })
    }

    /// Current throttle mitigations.
    pub fn throttle_state(&self) -> ThrottleState {
        self.throttle.state()
    }

    /// The resource monitor.
    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    /// Remaining headroom in the budget.
    pub fn available_mb(&self) -> f64 {
        self.budget.available_mb()
    }

    /// Outstanding grants.
    pub fn active_allocations(&self) -> Vec<AllocationRecord> {
        let records = self.ledger.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<_> = records.values().cloned().collect();
        list.sort_by_key(|r| r.id);
        list
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> ResourceManagerStats {
        ResourceManagerStats {
            memory_limit_mb: self.budget.capacity_mb(),
            reserved_mb: self.budget.reserved_mb(),
            available_mb: self.budget.available_mb(),
            pooled_mb: self.pools.pooled_mb(),
            active_allocations: self.ledger.records.lock().unwrap_or_else(PoisonError::into_inner).len(),
            granted_threads: self.ledger.threads.load(Ordering::Acquire),
            denied_allocations: self.denied.load(Ordering::Relaxed),
            throttle: self.throttle.state(),
            gc: self.gc.stats(),
            cache: self.cache.stats(),
            monitor: self.monitor.stats(),
        }
    }

    /// Loop period for a monitoring frequency factor in `(0, 1]`: a factor of
    /// 0.5 samples half as often.
    pub fn sampling_interval(&self, monitoring_factor: f64) -> Duration {
        let base = self.limits.monitor_interval().max(Duration::from_millis(10));
        let factor = if monitoring_factor.is_finite() {
            monitoring_factor.clamp(0.05, 1.0)
        } else {
            1.0
        };
        base.div_f64(factor)
    }

    /// Run the background loop until `cancel` fires. `monitoring_factor` is
    /// read before every wait so the period follows degradation.
    pub async fn run<F>(self: Arc<Self>, monitoring_factor: F, cancel: CancellationToken)
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        tracing::info!(
            interval_ms = self.sampling_interval(1.0).as_millis() as u64,
            "resource loop started"
        );
        let mut period = Duration::ZERO;
        loop {
            let manager = Arc::clone(&self);
            // Sampling the host can block for a few milliseconds.
            match tokio::task::spawn_blocking(move || manager.tick()).await {
                Ok(state) => tracing::trace!(throttle_level = state.level, "resource tick"),
                Err(e) => tracing::error!(error = %e, "resource tick panicked"),
            }
            let next = self.sampling_interval(monitoring_factor());
            if next != period {
                if !period.is_zero() {
                    tracing::debug!(interval_ms = next.as_millis() as u64, "resource sampling interval changed");
                }
                period = next;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        tracing::info!("resource loop stopped");
    }

    /// Optimization pass used by admission: the regular pass, then cache
    /// quartiles until `needed_mb` fits or the cache is empty.
    fn optimize_for(&self, needed_mb: f64) -> usize {
        let mut freed = self.optimize();
        while self.budget.available_mb() < needed_mb {
            let evicted = self.cache.force_evict_quartile();
            if evicted == 0 {
                break;
            }
            freed += evicted;
            self.sync_cache_accounting();
        }
        freed
    }

    fn sync_cache_accounting(&self) {
        let mut accounted = self.cache_accounted_mb.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let used = self.cache.stats().used_mb;
            let delta = used - *accounted;
            if delta <= 0.0 {
                self.budget.release(-delta);
                *accounted = used;
                return;
            }
            if self.budget.try_reserve(delta) {
                *accounted = used;
                return;
            }
            // Shrink the cache until its growth fits in the budget.
            if self.cache.force_evict_quartile() == 0 {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::probe::HardwareSample;
    use crate::testing::ScriptedProbe;
    use serde_json::json;

    fn manager_with(limit_mb: f64, probe: Arc<ScriptedProbe>) -> ResourceManager {
        let limits = ResourceLimits {
            memory_limit_mb: limit_mb,
            cache_capacity_mb: limit_mb,
            max_threads: 4,
            ..ResourceLimits::default()
        };
        ResourceManager::new(limits, GcConfig::default(), ThrottleConfig::default(), probe)
    }

    fn manager(limit_mb: f64) -> ResourceManager {
        manager_with(limit_mb, Arc::new(ScriptedProbe::new(HardwareSample::nominal())))
    }

    fn rss(mb: f64) -> HardwareSample {
        HardwareSample {
            memory_used_mb: mb,
            ..HardwareSample::nominal()
        }
    }

    #[test]
    fn guards_release_on_drop() {
        let rm = manager(10.0);
        let a = rm.allocate_for_operation("inference", 6.0, 1).expect("first grant");
        assert!(matches!(
            rm.allocate_for_operation("inference", 6.0, 1),
            Err(ServingError::ResourceExhausted { .. })
        ));
        assert_eq!(rm.stats().granted_threads, 1);
        drop(a);
        assert_eq!(rm.stats().active_allocations, 0);
        assert_eq!(rm.stats().granted_threads, 0);
        assert!(rm.allocate_for_operation("inference", 6.0, 1).is_ok());
        assert_eq!(rm.stats().denied_allocations, 1);
    }

    #[test]
    fn optimization_pass_frees_cache_for_admission() {
        let rm = manager(10.0);
        for i in 0..4 {
            assert!(rm.cache_put(&format!("k{i}"), json!(i), 2.0, CachePriority::Low));
        }
        assert!(rm.available_mb() < 3.0);
        // 4MB needed, 2MB free: the retry evicts cache entries first.
        let grant = rm.allocate_for_operation("training", 4.0, 0);
        assert!(grant.is_ok());
        assert!(rm.stats().reserved_mb <= 10.0 + 1e-9);
    }

    #[test]
    fn pools_count_against_the_budget() {
        let rm = manager(10.0);
        assert!(rm.allocate_pool("buffers", 8.0));
        assert!(rm.allocate_for_operation("inference", 3.0, 0).is_err());
        assert!(rm.release_pool("buffers"));
        assert!(rm.allocate_for_operation("inference", 3.0, 0).is_ok());
    }

    #[test]
    fn emergency_growth_triggers_aggressive_cleanup() {
        let probe = Arc::new(ScriptedProbe::new(rss(20.0)));
        let rm = manager_with(100.0, probe.clone());
        assert_eq!(rm.tick().level, 0.0);
        assert_eq!(rm.rss_baseline_mb(), Some(20.0));

        probe.set(rss(119.0));
        let state = rm.tick();
        assert!(state.level > 0.9);
        assert!(state.pause_non_critical);
        assert!(rm.stats().gc.aggressive_collections >= 1);
    }

    #[test]
    fn startup_footprint_is_not_pressure() {
        let probe = Arc::new(ScriptedProbe::new(rss(500.0)));
        let rm = manager_with(200.0, probe.clone());
        let state = rm.tick();
        assert_eq!(state.level, 0.0);
        assert!(!state.pause_non_critical);
        assert_eq!(rm.stats().gc.aggressive_collections, 0);

        // 40MB of growth on a 200MB budget stays below the activation ratio.
        probe.set(rss(540.0));
        assert_eq!(rm.tick().level, 0.0);
    }

    #[test]
    fn busy_workers_count_as_threads_in_use() {
        let rm = manager(10.0);
        let busy = Arc::new(AtomicUsize::new(0));
        rm.attach_worker_gauge(Arc::clone(&busy));
        let _grant = rm.allocate_for_operation("training", 1.0, 1).expect("grant");
        busy.store(3, Ordering::Release);
        assert_eq!(rm.threads_in_use(), 4);
        // Four of four threads busy saturates the thread term.
        assert_eq!(rm.refresh_throttle().level, 1.0);
    }

    #[test]
    fn reduced_monitoring_frequency_lengthens_the_period() {
        let rm = manager(200.0);
        let base = rm.sampling_interval(1.0);
        assert_eq!(rm.sampling_interval(0.5), base * 2);
        assert_eq!(rm.sampling_interval(f64::NAN), base);
        let floor = rm.sampling_interval(0.0);
        assert!(floor > base * 19 && floor < base * 21);
        assert_eq!(rm.sampling_interval(3.0), base);
    }
}
