//! # Priority Queue Set
//!
//! Four FIFO tiers, one per `Priority`. Enqueue is a plain append to the tier
//! of the item; draining always empties higher tiers first, so an item is
//! never placed behind a still-pending item of lower priority.
//!
//! The set itself is not synchronised. The engine owns one behind a mutex and
//! holds the lock only for an append or a drain.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::VecDeque;

use crate::core::request::{Prioritized, Priority};

/// # Priority Queue Set
#[derive(Debug)]
pub struct PriorityQueueSet<T> {
    tiers: [VecDeque<T>; 4],
}

impl<T> Default for PriorityQueueSet<T> {
    fn default() -> Self {
        Self {
            tiers: Default::default(),
        }
    }
}

impl<T: Prioritized> PriorityQueueSet<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `item` to the tail of its tier.
    pub fn enqueue(&mut self, item: T) {
        let tier = item.priority().index();
        self.tiers[tier].push_back(item);
    }

    /// Remove up to `n` items, CRITICAL first, each tier in arrival order.
    pub fn drain_up_to(&mut self, n: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(n.min(self.len()));
        for priority in Priority::DRAIN_ORDER {
            let tier = &mut self.tiers[priority.index()];
            while out.len() < n {
                match tier.pop_front() {
                    Some(item) => out.push(item),
                    None => break,
                }
            }
            if out.len() == n {
                break;
            }
        }
        out
    }

    /// Remove and return every item matching `pred`, preserving the order of
    /// the items left behind.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        for tier in self.tiers.iter_mut() {
            let mut kept = VecDeque::with_capacity(tier.len());
            for item in tier.drain(..) {
                if pred(&item) {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *tier = kept;
        }
        removed
    }

    /// Items waiting across all tiers.
    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    /// Whether every tier is empty.
    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Items waiting in the tier of `priority`.
    pub fn depth(&self, priority: Priority) -> usize {
        self.tiers[priority.index()].len()
    }

    /// Depth of every tier, indexed by `Priority::index`.
    pub fn depth_by_priority(&self) -> [usize; 4] {
        [
            self.tiers[0].len(),
            self.tiers[1].len(),
            self.tiers[2].len(),
            self.tiers[3].len(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Item(Priority, u32);

    impl Prioritized for Item {
        fn priority(&self) -> Priority {
            self.0
        }
    }

    #[test]
    fn drains_by_priority_then_fifo() {
        let mut q = PriorityQueueSet::new();
        q.enqueue(Item(Priority::Low, 1));
        q.enqueue(Item(Priority::Normal, 2));
        q.enqueue(Item(Priority::Critical, 3));
        q.enqueue(Item(Priority::Normal, 4));
        q.enqueue(Item(Priority::High, 5));

        let drained = q.drain_up_to(4);
        let ids: Vec<u32> = drained.iter().map(|i| i.1).collect();
        assert_eq!(ids, vec![3, 5, 2, 4]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.depth(Priority::Low), 1);
    }

    #[test]
    fn remove_where_keeps_remaining_order() {
        let mut q = PriorityQueueSet::new();
        for n in 0..6 {
            q.enqueue(Item(Priority::Normal, n));
        }
        let removed = q.remove_where(|i| i.1 % 2 == 0);
        assert_eq!(removed.len(), 3);
        let ids: Vec<u32> = q.drain_up_to(10).iter().map(|i| i.1).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert!(q.is_empty());
        assert_eq!(q.drain_up_to(3), Vec::<Item>::new());
    }
}
