//! # Memory Budget and Named Pools
//!
//! A centralized accountant for every megabyte the engine hands out, whether
//! as a long-lived named pool or as a short-lived per-operation grant.
//!
//! ## Core Functionality:
//!
//! - **Atomic Reservation**: `MemoryBudget` keeps the outstanding amount in an
//!   `AtomicU64` (kilobytes). `try_reserve` is a compare-and-swap loop, so the
//!   check and the increment happen as one step: concurrent callers can never
//!   jointly push the total above capacity.
//!
//! - **Shared Accounting**: named pools and operation grants draw from the same
//!   `Arc<MemoryBudget>`, which is what makes "cumulative granted allocations
//!   never exceed the budget" hold across both.
//!
//! - **No Eviction Here**: the budget only says yes or no. Reclaiming memory is
//!   the job of the cache and the collection scheduler.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const KB_PER_MB: f64 = 1024.0;

fn mb_to_kb(mb: f64) -> u64 {
    (mb.max(0.0) * KB_PER_MB).ceil() as u64
}

fn kb_to_mb(kb: u64) -> f64 {
    kb as f64 / KB_PER_MB
}

/// # Memory Budget
///
/// Thread-safe, lock-free accounting of outstanding memory against a fixed
/// capacity.
#[derive(Debug)]
pub struct MemoryBudget {
    /// Hard limit in kilobytes.
    capacity_kb: u64,
    /// Outstanding reservations in kilobytes.
    reserved_kb: AtomicU64,
}

impl MemoryBudget {
    /// Creates a budget of `capacity_mb` megabytes.
    pub fn new(capacity_mb: f64) -> Self {
        Self {
            capacity_kb: mb_to_kb(capacity_mb),
            reserved_kb: AtomicU64::new(0),
        }
    }

    /// # Try Reserve
    ///
    /// Reserve `mb` if, and only if, the new total stays within capacity.
    ///
    /// `AcqRel` on success orders the reservation before whatever the caller
    /// does with the granted memory; the retry loop re-reads the current value
    /// whenever another task won the race.
    pub fn try_reserve(&self, mb: f64) -> bool {
        let kb = mb_to_kb(mb);
        let mut current = self.reserved_kb.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(kb) {
                Some(n) if n <= self.capacity_kb => n,
                _ => return false,
            };
            match self
                .reserved_kb
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `mb` to the budget. Over-release saturates at zero.
    pub fn release(&self, mb: f64) {
        let kb = mb_to_kb(mb);
        let _ = self
            .reserved_kb
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| Some(cur.saturating_sub(kb)));
    }

    /// Outstanding reservations in megabytes.
    pub fn reserved_mb(&self) -> f64 {
        kb_to_mb(self.reserved_kb.load(Ordering::Acquire))
    }

    /// Capacity in megabytes.
    pub fn capacity_mb(&self) -> f64 {
        kb_to_mb(self.capacity_kb)
    }

    /// Remaining headroom in megabytes.
    pub fn available_mb(&self) -> f64 {
        (self.capacity_mb() - self.reserved_mb()).max(0.0)
    }

    /// Reserved fraction of capacity, in percent.
    pub fn usage_percent(&self) -> f64 {
        if self.capacity_kb == 0 {
            0.0
        } else {
            (self.reserved_kb.load(Ordering::Acquire) as f64 / self.capacity_kb as f64) * 100.0
        }
    }
}

/// One named pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryPool {
    /// Pool name.
    pub name: String,
    /// Reserved size in megabytes.
    pub size_mb: f64,
    /// When the pool was created.
    pub created_at: DateTime<Utc>,
}

/// # Memory Pool Manager
///
/// Named pools carved out of a shared `MemoryBudget`.
pub struct MemoryPoolManager {
    budget: Arc<MemoryBudget>,
    pools: Mutex<HashMap<String, MemoryPool>>,
}

impl MemoryPoolManager {
    /// Creates a manager over `budget`.
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            budget,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Create a pool, rejecting it if the budget cannot cover `size_mb` or a
    /// pool of that name already exists.
    pub fn allocate_pool(&self, name: &str, size_mb: f64) -> bool {
        if size_mb <= 0.0 {
            return false;
        }
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if pools.contains_key(name) {
            tracing::warn!(pool = name, "memory pool already exists");
            return false;
        }
        if !self.budget.try_reserve(size_mb) {
            tracing::warn!(
                pool = name,
                size_mb,
                available_mb = self.budget.available_mb(),
                "memory pool rejected: budget exceeded"
            );
            return false;
        }
        pools.insert(
            name.to_string(),
            MemoryPool {
                name: name.to_string(),
                size_mb,
                created_at: Utc::now(),
            },
        );
        tracing::debug!(pool = name, size_mb, "memory pool allocated");
        true
    }

    /// Release a pool; returns whether it existed.
    pub fn release_pool(&self, name: &str) -> bool {
        let removed = self.pools.lock().unwrap_or_else(PoisonError::into_inner).remove(name);
        match removed {
            Some(pool) => {
                self.budget.release(pool.size_mb);
                true
            }
            None => false,
        }
    }

    /// Snapshot of all pools.
    pub fn pools(&self) -> Vec<MemoryPool> {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<_> = pools.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Total megabytes held by pools.
    pub fn pooled_mb(&self) -> f64 {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|p| p.size_mb)
            .sum()
    }
}
