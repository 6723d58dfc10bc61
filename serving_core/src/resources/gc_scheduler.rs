//! # Collection Scheduler
//!
//! Decides when, and how aggressively, reclaimable memory is swept. There is
//! no tracing collector in this process; instead every component that holds
//! droppable state registers a `Collector`, and a collection pass asks each
//! of them to release what belongs to the swept generations.
//!
//! - **Young**: short-lived state that was never used (unread cache entries).
//! - **Mature**: live but cheap-to-rebuild state (low-ranked cache entries).
//! - **Old**: long-lived histories (monitor samples, performance records).
//!
//! A normal pass sweeps only the young generation; an aggressive pass sweeps
//! all three.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::configs::GcConfig;

/// Generations a collection pass can sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Generation {
    /// Never-used, short-lived objects.
    Young,
    /// Live but rebuildable objects.
    Mature,
    /// Long-lived histories.
    Old,
}

impl Generation {
    /// Every generation, youngest first.
    pub const ALL: [Generation; 3] = [Generation::Young, Generation::Mature, Generation::Old];
}

/// Something that can release memory belonging to a generation.
pub trait Collector: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Release what belongs to `generation`; returns the number of objects freed.
    fn collect(&self, generation: Generation) -> usize;
}

/// Counters over all collection passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcStats {
    /// Passes executed.
    pub collections: u64,
    /// Passes that swept every generation.
    pub aggressive_collections: u64,
    /// Mean pass duration.
    pub average_duration_ms: f64,
    /// Objects released over all passes.
    pub objects_collected: u64,
    /// When the last pass ran.
    pub last_collection: Option<DateTime<Utc>>,
}

struct GcState {
    last_run: Option<Instant>,
    total_duration_ms: f64,
    stats: GcStats,
}

/// # Collection Scheduler
pub struct GcScheduler {
    config: GcConfig,
    collectors: Mutex<Vec<Arc<dyn Collector>>>,
    state: Mutex<GcState>,
}

impl GcScheduler {
    /// Create a scheduler with no collectors registered.
    pub fn new(config: GcConfig) -> Self {
        Self {
            config,
            collectors: Mutex::new(Vec::new()),
            state: Mutex::new(GcState {
                last_run: None,
                total_duration_ms: 0.0,
                stats: GcStats::default(),
            }),
        }
    }

    /// Add a collector to every subsequent pass.
    pub fn register(&self, collector: Arc<dyn Collector>) {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(collector);
    }

    /// Whether a pass should run at `memory_mb` of usage.
    ///
    /// True above the threshold once the cooldown elapsed, and always above
    /// `threshold * force_multiplier`.
    pub fn should_collect(&self, memory_mb: f64) -> bool {
        if memory_mb > self.config.threshold_mb * self.config.force_multiplier {
            return true;
        }
        if memory_mb <= self.config.threshold_mb {
            return false;
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.last_run {
            None => true,
            Some(at) => at.elapsed() >= Duration::from_millis(self.config.cooldown_ms),
        }
    }

    /// Run one pass; returns the number of objects released.
    pub fn collect(&self, aggressive: bool) -> usize {
        let started = Instant::now();
        let collectors: Vec<Arc<dyn Collector>> = self
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let generations: &[Generation] = if aggressive {
            &Generation::ALL
        } else {
            &Generation::ALL[..1]
        };

        let mut freed = 0;
        for generation in generations {
            for collector in &collectors {
                let n = collector.collect(*generation);
                if n > 0 {
                    tracing::trace!(collector = collector.name(), ?generation, freed = n, "collector swept");
                }
                freed += n;
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_run = Some(Instant::now());
        state.total_duration_ms += elapsed_ms;
        state.stats.collections += 1;
        if aggressive {
            state.stats.aggressive_collections += 1;
        }
        state.stats.objects_collected += freed as u64;
        state.stats.average_duration_ms = state.total_duration_ms / state.stats.collections as f64;
        state.stats.last_collection = Some(Utc::now());
        tracing::debug!(aggressive, freed, elapsed_ms, "collection pass finished");
        freed
    }

    /// Counters over all passes.
    pub fn stats(&self) -> GcStats {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCollector {
        young: AtomicUsize,
        other: AtomicUsize,
    }

    impl Collector for CountingCollector {
        fn name(&self) -> &str {
            "counting"
        }

        fn collect(&self, generation: Generation) -> usize {
            match generation {
                Generation::Young => self.young.fetch_add(1, Ordering::SeqCst),
                _ => self.other.fetch_add(1, Ordering::SeqCst),
            };
            1
        }
    }

    fn config() -> GcConfig {
        GcConfig {
            threshold_mb: 100.0,
            cooldown_ms: 60_000,
            force_multiplier: 1.2,
        }
    }

    #[test]
    fn cooldown_gates_collection_unless_forced() {
        let gc = GcScheduler::new(config());
        assert!(!gc.should_collect(90.0));
        assert!(gc.should_collect(110.0));
        gc.collect(false);
        assert!(!gc.should_collect(110.0));
        assert!(gc.should_collect(121.0));
    }

    #[test]
    fn aggressive_pass_sweeps_all_generations() {
        let gc = GcScheduler::new(config());
        let collector = Arc::new(CountingCollector {
            young: AtomicUsize::new(0),
            other: AtomicUsize::new(0),
        });
        gc.register(collector.clone());

        assert_eq!(gc.collect(false), 1);
        assert_eq!(collector.other.load(Ordering::SeqCst), 0);
        assert_eq!(gc.collect(true), 3);
        assert_eq!(collector.young.load(Ordering::SeqCst), 2);
        assert_eq!(collector.other.load(Ordering::SeqCst), 2);

        let stats = gc.stats();
        assert_eq!(stats.collections, 2);
        assert_eq!(stats.aggressive_collections, 1);
        assert_eq!(stats.objects_collected, 4);
        assert!(stats.last_collection.is_some());
    }
}
