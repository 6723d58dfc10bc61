//! # Batch Formation
//!
//! `BatchSizeOptimizer` keeps a rolling window of completed batch samples and
//! picks the size the next batch should aim for. `BatchFormer` drains the
//! priority queues up to that size.
//!
//! ## Size Selection:
//!
//! - Without history the configured default is used.
//! - Once ten samples exist, the recent five are compared with the five before
//!   them. A throughput drop larger than `trend_drop_ratio` steps the size
//!   down by `tuning_step`, never below `min_batch_size`.
//! - Otherwise the size steps toward the batch size with the best average
//!   throughput seen in the window.
//! - The result is always clamped to `[min, min(max, available)]`; when fewer
//!   than `min` requests wait, all of them are taken.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batching::queue::PriorityQueueSet;
use crate::configs::BatchingConfig;
use crate::core::request::Prioritized;

const TREND_WINDOW: usize = 5;

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Formed, not yet handed to the backend.
    Pending,
    /// Backend call in flight.
    Processing,
    /// Every item has a result.
    Completed,
    /// The batch could not be processed.
    Failed,
}

/// # Batch
#[derive(Debug)]
pub struct Batch<T> {
    /// Batch id.
    pub id: String,
    /// Items in drain order.
    pub items: Vec<T>,
    /// Lifecycle state.
    pub status: BatchStatus,
    /// Size the former aimed for.
    pub optimal_size: usize,
    /// Formation time.
    pub created_at: DateTime<Utc>,
}

impl<T> Batch<T> {
    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch holds no item.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// One completed batch, as observed by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSample {
    /// Items in the batch.
    pub batch_size: usize,
    /// Wall time of the backend call.
    pub processing_time_ms: f64,
    /// Items per second.
    pub throughput: f64,
}

impl BatchSample {
    /// Build a sample, deriving throughput from size and time.
    pub fn new(batch_size: usize, processing_time_ms: f64) -> Self {
        let throughput = if processing_time_ms > 0.0 {
            batch_size as f64 * 1000.0 / processing_time_ms
        } else {
            batch_size as f64 * 1000.0
        };
        Self {
            batch_size,
            processing_time_ms,
            throughput,
        }
    }
}

/// # Batch Size Optimizer
#[derive(Debug)]
pub struct BatchSizeOptimizer {
    config: BatchingConfig,
    history: VecDeque<BatchSample>,
    current: usize,
}

impl BatchSizeOptimizer {
    /// Start at the configured default.
    pub fn new(config: BatchingConfig) -> Self {
        let current = config
            .default_batch_size
            .clamp(config.min_batch_size, config.max_batch_size);
        Self {
            history: VecDeque::with_capacity(config.history_window),
            config,
            current,
        }
    }

    /// Size the next batch aims for before clamping to the queue.
    pub fn target(&self) -> usize {
        self.current
    }

    /// # Determine Optimal Batch Size
    ///
    /// The target clamped to `[min, min(max, available)]`. When fewer than
    /// `min` items are available all of them are taken; with nothing
    /// available the answer is 0.
    pub fn determine_optimal(&self, available: usize) -> usize {
        self.determine_scaled(available, 1.0)
    }

    /// Like `determine_optimal`, with the target scaled by `factor` first.
    pub fn determine_scaled(&self, available: usize, factor: f64) -> usize {
        let factor = if factor.is_finite() { factor.clamp(0.0, 1.0) } else { 1.0 };
        let scaled = ((self.current as f64) * factor).floor() as usize;
        let upper = self.config.max_batch_size.min(available);
        let lower = self.config.min_batch_size.min(upper);
        scaled.clamp(lower, upper)
    }

    /// Add a completed batch and retune.
    pub fn record(&mut self, sample: BatchSample) {
        if self.history.len() == self.config.history_window.max(2 * TREND_WINDOW) {
            self.history.pop_front();
        }
        self.history.push_back(sample);
        self.auto_tune();
    }

    /// Shrink the target by one tuning step, never below `min_batch_size`.
    pub fn step_down(&mut self) -> usize {
        self.current = self
            .current
            .saturating_sub(self.config.tuning_step)
            .max(self.config.min_batch_size);
        self.current
    }

    /// Samples currently in the window.
    pub fn samples(&self) -> usize {
        self.history.len()
    }

    fn auto_tune(&mut self) {
        if self.history.len() < 2 * TREND_WINDOW {
            return;
        }
        let n = self.history.len();
        let recent = Self::mean_throughput(self.history.range(n - TREND_WINDOW..));
        let prior = Self::mean_throughput(self.history.range(n - 2 * TREND_WINDOW..n - TREND_WINDOW));
        let min = self.config.min_batch_size;
        let max = self.config.max_batch_size;
        let step = self.config.tuning_step;

        if prior > 0.0 && recent < prior * (1.0 - self.config.trend_drop_ratio) {
            let next = self.current.saturating_sub(step).max(min);
            if next != self.current {
                tracing::debug!(from = self.current, to = next, recent, prior, "throughput trending down, shrinking batch");
            }
            self.current = next;
            return;
        }

        if let Some(best) = self.best_size() {
            if best >= self.current {
                // At the best size seen so far: probe one step further.
                self.current = (self.current + step).min(max);
            } else {
                self.current = self.current.saturating_sub(step).max(best).max(min);
            }
        }
    }

    fn best_size(&self) -> Option<usize> {
        let mut by_size: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
        for s in &self.history {
            let e = by_size.entry(s.batch_size).or_insert((0.0, 0));
            e.0 += s.throughput;
            e.1 += 1;
        }
        by_size
            .into_iter()
            .map(|(size, (sum, count))| (size, sum / count as f64))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(size, _)| size)
    }

    fn mean_throughput<'a>(samples: impl Iterator<Item = &'a BatchSample>) -> f64 {
        let (sum, count) = samples.fold((0.0, 0usize), |(s, c), x| (s + x.throughput, c + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}

/// # Batch Former
///
/// Shared between the formation loop, which drains, and the executors, which
/// report samples.
#[derive(Debug)]
pub struct BatchFormer {
    optimizer: Mutex<BatchSizeOptimizer>,
}

impl BatchFormer {
    /// Create a former with a fresh optimizer.
    pub fn new(config: BatchingConfig) -> Self {
        Self {
            optimizer: Mutex::new(BatchSizeOptimizer::new(config)),
        }
    }

    /// Optimal size for `available` waiting items.
    pub fn determine_optimal_batch_size(&self, available: usize) -> usize {
        self.optimizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .determine_optimal(available)
    }

    /// # Form Batch
    ///
    /// Drain up to the optimal size (scaled by `size_factor`) from `queue`.
    /// Returns `None` iff every tier is empty.
    pub fn form_batch<T: Prioritized>(&self, queue: &mut PriorityQueueSet<T>, size_factor: f64) -> Option<Batch<T>> {
        if queue.is_empty() {
            return None;
        }
        let optimal = self
            .optimizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .determine_scaled(queue.len(), size_factor);
        let items = queue.drain_up_to(optimal);
        Some(Batch {
            id: Uuid::new_v4().to_string(),
            items,
            status: BatchStatus::Pending,
            optimal_size: optimal,
            created_at: Utc::now(),
        })
    }

    /// Queue length at which a batch scaled by `size_factor` is full.
    pub fn scaled_target(&self, size_factor: f64) -> usize {
        self.optimizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .determine_scaled(usize::MAX, size_factor)
    }

    /// Report a completed batch.
    pub fn record(&self, sample: BatchSample) {
        self.optimizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(sample);
    }

    /// Shrink the target by one step; returns the new target.
    pub fn step_down(&self) -> usize {
        self.optimizer.lock().unwrap_or_else(PoisonError::into_inner).step_down()
    }

    /// Current unclamped target.
    pub fn target(&self) -> usize {
        self.optimizer.lock().unwrap_or_else(PoisonError::into_inner).target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BatchingConfig {
        BatchingConfig {
            min_batch_size: 2,
            max_batch_size: 16,
            default_batch_size: 8,
            ..BatchingConfig::default()
        }
    }

    #[test]
    fn optimal_size_stays_within_bounds() {
        let opt = BatchSizeOptimizer::new(config());
        for n in 0..64 {
            let size = opt.determine_optimal(n);
            let upper = 16.min(n);
            assert!(size <= upper, "n={n} size={size}");
            if n >= 2 {
                assert!(size >= 2, "n={n} size={size}");
            } else {
                assert_eq!(size, n);
            }
        }
        assert_eq!(opt.determine_optimal(100), 8);
    }

    #[test]
    fn downward_trend_steps_down_to_min() {
        let mut opt = BatchSizeOptimizer::new(config());
        for _ in 0..5 {
            opt.record(BatchSample::new(8, 8.0));
        }
        // Throughput collapses to a quarter.
        for _ in 0..5 {
            opt.record(BatchSample::new(8, 32.0));
        }
        assert!(opt.target() < 8);
        for _ in 0..40 {
            opt.record(BatchSample::new(2, 1000.0));
        }
        assert!(opt.target() >= 2);
    }

    #[test]
    fn scaled_target_shrinks_batches() {
        let opt = BatchSizeOptimizer::new(config());
        assert_eq!(opt.determine_scaled(100, 0.5), 4);
        assert_eq!(opt.determine_scaled(100, 0.0), 2);
    }
}
