// packages/engine/src/runtime/load_balancer.rs
//! Least-loaded instance selection
//!
//! Keeps one approximate usage counter per instance and hands out the
//! ordinal with the fewest users among the first `resource_limit` ordinals.
//!
//! # Layout
//!
//! ```text
//! uses: [ CachePadded<AtomicU64> ; capacity ]
//!         ^ one cache line each, so neighbouring counters never contend
//! ```
//!
//! The counters spread load; they do not provide mutual exclusion. Every
//! `acquire` must be paired with exactly one `free`.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{trace, warn};

/// Approximate per-instance usage tracker
#[derive(Debug)]
pub struct LoadBalancer {
    /// Users per instance ordinal
    uses: Box<[CachePadded<AtomicU64>]>,

    /// Ordinals `< limit` are eligible
    limit: AtomicUsize,
}

impl LoadBalancer {
    /// Create a balancer over `capacity` instances, all eligible
    pub fn new(capacity: usize) -> Self {
        let uses = (0..capacity)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            uses,
            limit: AtomicUsize::new(capacity),
        }
    }

    /// Number of allocated counters
    pub fn capacity(&self) -> usize {
        self.uses.len()
    }

    /// Number of eligible ordinals
    pub fn resource_limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Restrict (or widen) the eligible ordinals to `0..n`
    ///
    /// # Panics
    ///
    /// If `n` exceeds [`capacity`](Self::capacity).
    pub fn set_resource_limit(&self, n: usize) {
        assert!(
            n <= self.capacity(),
            "resource limit {} exceeds allocated capacity {}",
            n,
            self.capacity()
        );
        self.limit.store(n, Ordering::Relaxed);
    }

    /// Pick the least-used eligible ordinal and count one more user on it
    ///
    /// An idle ordinal is claimed with a compare-exchange from zero, so two
    /// concurrent callers never both claim the same idle ordinal. When no
    /// ordinal is idle the minimum is taken, lowest ordinal first on ties.
    /// With an empty eligible set, ordinal 0 is used.
    pub fn acquire(&self) -> usize {
        let limit = self.resource_limit().min(self.capacity());

        let mut min_uses = u64::MAX;
        let mut min_ordinal = 0;

        for (ordinal, uses) in self.uses[..limit].iter().enumerate() {
            match uses.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    trace!("Claimed idle instance {}", ordinal);
                    return ordinal;
                }
                Err(current) if current < min_uses => {
                    min_uses = current;
                    min_ordinal = ordinal;
                }
                Err(_) => {}
            }
        }

        self.uses[min_ordinal].fetch_add(1, Ordering::AcqRel);
        trace!("Shared instance {} (had {} users)", min_ordinal, min_uses);
        min_ordinal
    }

    /// Count one user less on `ordinal`
    ///
    /// The counter never drops below zero; an unmatched `free` is ignored.
    pub fn free(&self, ordinal: usize) {
        let released = self.uses[ordinal].fetch_update(Ordering::AcqRel, Ordering::Relaxed, |uses| {
            uses.checked_sub(1)
        });
        if released.is_err() {
            warn!("free({}) without matching acquire", ordinal);
        }
    }

    /// Current (approximate) number of users of `ordinal`
    pub fn usage(&self, ordinal: usize) -> u64 {
        self.uses[ordinal].load(Ordering::Relaxed)
    }

    /// Usage of every allocated ordinal
    pub fn usages(&self) -> Vec<u64> {
        self.uses.iter().map(|u| u.load(Ordering::Relaxed)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Barrier;

    #[test]
    fn test_sequential_acquire_is_distinct() {
        let balancer = LoadBalancer::new(3);
        let picked: Vec<usize> = (0..3).map(|_| balancer.acquire()).collect();
        assert_eq!(picked, vec![0, 1, 2]);
    }

    #[test]
    fn test_fourth_acquire_shares_lowest_ordinal() {
        let balancer = LoadBalancer::new(3);
        for _ in 0..3 {
            balancer.acquire();
        }
        let fourth = balancer.acquire();
        assert_eq!(fourth, 0);
        assert_eq!(balancer.usage(0), 2);
        assert_eq!(balancer.usages(), vec![2, 1, 1]);
    }

    #[test]
    fn test_free_restores_counter() {
        let balancer = LoadBalancer::new(2);
        let ordinal = balancer.acquire();
        assert_eq!(balancer.usage(ordinal), 1);
        balancer.free(ordinal);
        assert_eq!(balancer.usage(ordinal), 0);
        assert_eq!(balancer.acquire(), ordinal);
    }

    #[test]
    fn test_unmatched_free_keeps_counter_at_zero() {
        let balancer = LoadBalancer::new(2);
        balancer.free(1);
        assert_eq!(balancer.usage(1), 0);

        assert_eq!(balancer.acquire(), 0);
        assert_eq!(balancer.acquire(), 1);
        assert_eq!(balancer.usages(), vec![1, 1]);
    }

    #[test]
    fn test_prefers_least_used() {
        let balancer = LoadBalancer::new(3);
        let a = balancer.acquire();
        let b = balancer.acquire();
        let _c = balancer.acquire();
        balancer.acquire();
        balancer.free(b);
        assert_eq!(a, 0);
        assert_eq!(balancer.acquire(), 1);
    }

    #[test]
    fn test_resource_limit() {
        let balancer = LoadBalancer::new(4);
        balancer.set_resource_limit(2);
        assert_eq!(balancer.resource_limit(), 2);
        for _ in 0..10 {
            assert!(balancer.acquire() < 2);
        }
        assert_eq!(balancer.usage(2), 0);
        assert_eq!(balancer.usage(3), 0);

        balancer.set_resource_limit(4);
        assert_eq!(balancer.acquire(), 2);
    }

    #[test]
    fn test_zero_limit_falls_back_to_first() {
        let balancer = LoadBalancer::new(2);
        balancer.set_resource_limit(0);
        assert_eq!(balancer.acquire(), 0);
        assert_eq!(balancer.usage(0), 1);
    }

    #[test]
    #[should_panic(expected = "exceeds allocated capacity")]
    fn test_limit_above_capacity_panics() {
        let balancer = LoadBalancer::new(2);
        balancer.set_resource_limit(3);
    }

    #[test]
    fn test_concurrent_acquire_is_distinct() {
        const THREADS: usize = 8;
        let balancer = LoadBalancer::new(THREADS);
        let barrier = Barrier::new(THREADS);

        let picked: HashSet<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        balancer.acquire()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(picked.len(), THREADS);
        assert!(balancer.usages().iter().all(|&u| u == 1));
    }

    proptest! {
        #[test]
        fn prop_acquisitions_within_limit_are_distinct(capacity in 1usize..32, limit_seed in 0usize..32) {
            let limit = 1 + limit_seed % capacity;
            let balancer = LoadBalancer::new(capacity);
            balancer.set_resource_limit(limit);

            let picked: HashSet<usize> = (0..limit).map(|_| balancer.acquire()).collect();
            prop_assert_eq!(picked.len(), limit);
            prop_assert!(picked.iter().all(|&o| o < limit));
        }

        #[test]
        fn prop_free_balances_acquire(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
            let balancer = LoadBalancer::new(4);
            let mut held = Vec::new();
            for acquire in ops {
                if acquire || held.is_empty() {
                    held.push(balancer.acquire());
                } else {
                    balancer.free(held.pop().unwrap());
                }
            }
            prop_assert_eq!(balancer.usages().iter().sum::<u64>(), held.len() as u64);
            for ordinal in held.drain(..) {
                balancer.free(ordinal);
            }
            prop_assert!(balancer.usages().iter().all(|&u| u == 0));
        }
    }
}
