//! # Worker Pool
//!
//! Backend calls are synchronous and CPU bound, so they run on tokio's
//! blocking threads behind two semaphores:
//!
//! - the **general lane** (`max_threads - reserved`) serves batched and direct
//!   work,
//! - the **immediate lane** (`reserved`) serves urgent requests first and
//!   spills onto the general lane only when its own permits are taken.
//!
//! Every call is wrapped in the hard backend timeout. A call that times out
//! keeps its permit until the backend finally returns, so a hung backend
//! shrinks the pool instead of oversubscribing the host.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::errors::{Result, ServingError};

/// Which permits a call may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lane {
    /// Reserved permits first, then general ones.
    Immediate,
    /// General permits only.
    General,
}

/// Counters of the pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    /// General permits.
    pub general_slots: usize,
    /// Reserved permits.
    pub immediate_slots: usize,
    /// Calls currently running.
    pub busy: usize,
    /// Calls that hit the hard timeout.
    pub timeouts: u64,
}

/// # Worker Pool
pub struct WorkerPool {
    general: Arc<Semaphore>,
    immediate: Arc<Semaphore>,
    general_slots: usize,
    immediate_slots: usize,
    hard_timeout: Duration,
    busy: Arc<AtomicUsize>,
    timeouts: AtomicU64,
}

impl WorkerPool {
    /// Pool of `max_threads` permits, `reserved` of them for the immediate lane.
    pub fn new(max_threads: usize, reserved: usize, hard_timeout: Duration) -> Self {
        let max_threads = max_threads.max(1);
        let immediate_slots = reserved.min(max_threads - 1);
        let general_slots = max_threads - immediate_slots;
        Self {
            general: Arc::new(Semaphore::new(general_slots)),
            immediate: Arc::new(Semaphore::new(immediate_slots)),
            general_slots,
            immediate_slots,
            hard_timeout,
            busy: Arc::new(AtomicUsize::new(0)),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Run `f` on a blocking thread under the hard timeout.
    pub async fn run<F, R>(&self, lane: Lane, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.run_with_timeout(lane, self.hard_timeout, f).await
    }

    /// Run `f` on a blocking thread under `timeout` instead of the hard one.
    pub async fn run_with_timeout<F, R>(&self, lane: Lane, timeout: Duration, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self.acquire(lane).await?;
        let busy = Arc::clone(&self.busy);
        busy.fetch_add(1, Ordering::AcqRel);
        let handle = tokio::task::spawn_blocking(move || {
            let out = f();
            busy.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
            out
        });
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(join)) => Err(ServingError::model(format!("backend call panicked: {join}"))),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "backend call hit hard timeout");
                Err(ServingError::timeout(format!(
                    "backend call exceeded {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn acquire(&self, lane: Lane) -> Result<OwnedSemaphorePermit> {
        if lane == Lane::Immediate {
            if let Ok(p) = Arc::clone(&self.immediate).try_acquire_owned() {
                return Ok(p);
            }
            if let Ok(p) = Arc::clone(&self.general).try_acquire_owned() {
                return Ok(p);
            }
            // Whichever lane frees up first.
            let permit = tokio::select! {
                p = Arc::clone(&self.immediate).acquire_owned() => p,
                p = Arc::clone(&self.general).acquire_owned() => p,
            };
            return permit.map_err(|_| ServingError::EngineClosed);
        }
        Arc::clone(&self.general)
            .acquire_owned()
            .await
            .map_err(|_| ServingError::EngineClosed)
    }

    /// Calls currently running.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Shared counter of running calls, for pressure accounting elsewhere.
    pub fn busy_gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.busy)
    }

    /// Refuse every future call.
    pub fn close(&self) {
        self.general.close();
        self.immediate.close();
    }

    /// Counters.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            general_slots: self.general_slots,
            immediate_slots: self.immediate_slots,
            busy: self.busy(),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}
