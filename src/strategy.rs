// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Selection Strategies (C3): pure functions over a non-empty, healthy
//! backend list. The caller never invokes a strategy with an empty list.

use crate::registry::Backend;
use fnv::FnvHasher;
use rand::Rng;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    RoundRobin,
    LeastConnections,
    IpHash,
    Weighted,
}

impl SelectionStrategy {
    /// Ordinal matching the original `static_cast<int>(strategy_)`, carried
    /// into `REQUEST_ROUTED.strategy` so existing dashboard tooling that
    /// expects a small integer keeps working.
    pub fn ordinal(self) -> u8 {
        match self {
            SelectionStrategy::RoundRobin => 0,
            SelectionStrategy::LeastConnections => 1,
            SelectionStrategy::IpHash => 2,
            SelectionStrategy::Weighted => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LeastConnections => "least_connections",
            SelectionStrategy::IpHash => "ip_hash",
            SelectionStrategy::Weighted => "weighted",
        }
    }
}

/// Holds the mutable state a strategy needs across calls: the round-robin
/// cursor. One instance is shared by both pools, so the cursor advances
/// monotonically across the whole component rather than per pool.
#[derive(Default)]
pub struct Strategies {
    round_robin_index: AtomicU64,
}

impl Strategies {
    pub fn new() -> Self {
        Strategies::default()
    }

    /// Selects a backend from `backends` per `strategy`. Callers must ensure
    /// `backends` is non-empty.
    pub fn select(&self, strategy: SelectionStrategy, backends: &[Arc<Backend>], client_ip: &str) -> Arc<Backend> {
        debug_assert!(!backends.is_empty(), "select() requires a non-empty backend list");
        match strategy {
            SelectionStrategy::RoundRobin => self.round_robin(backends),
            SelectionStrategy::LeastConnections => least_connections(backends),
            SelectionStrategy::IpHash => self.ip_hash(backends, client_ip),
            SelectionStrategy::Weighted => self.weighted(backends),
        }
    }

    fn round_robin(&self, backends: &[Arc<Backend>]) -> Arc<Backend> {
        let index = self.round_robin_index.fetch_add(1, Ordering::Relaxed) as usize % backends.len();
        backends[index].clone()
    }

    fn ip_hash(&self, backends: &[Arc<Backend>], client_ip: &str) -> Arc<Backend> {
        if client_ip.is_empty() {
            return self.round_robin(backends);
        }
        let mut hasher = FnvHasher::default();
        client_ip.hash(&mut hasher);
        let index = (hasher.finish() as usize) % backends.len();
        backends[index].clone()
    }

    fn weighted(&self, backends: &[Arc<Backend>]) -> Arc<Backend> {
        let weights: Vec<u64> = backends
            .iter()
            .map(|b| (b.weight.round() as i64).max(1) as u64)
            .collect();
        let total: u64 = weights.iter().sum();
        if total == 0 {
            return self.round_robin(backends);
        }

        let draw = rand::thread_rng().gen_range(1..=total);
        let mut cumulative = 0u64;
        for (backend, weight) in backends.iter().zip(weights.iter()) {
            cumulative += weight;
            if draw <= cumulative {
                return backend.clone();
            }
        }
        backends.last().expect("non-empty").clone()
    }
}

fn least_connections(backends: &[Arc<Backend>]) -> Arc<Backend> {
    backends
        .iter()
        .min_by_key(|b| b.current_clients())
        .expect("non-empty")
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(n: usize) -> Vec<Arc<Backend>> {
        (0..n)
            .map(|i| Arc::new(Backend::new(format!("b{i}"), "127.0.0.1", 9000 + i as u16, false, 1.0)))
            .collect()
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let strategies = Strategies::new();
        let backends = backends(3);
        let picks: Vec<String> = (0..6)
            .map(|_| strategies.select(SelectionStrategy::RoundRobin, &backends, "").id.clone())
            .collect();
        assert_eq!(picks, vec!["b0", "b1", "b2", "b0", "b1", "b2"]);
    }

    #[test]
    fn least_connections_picks_minimum() {
        let strategies = Strategies::new();
        let backends = backends(3);
        backends[0].record_selected();
        backends[0].record_selected();
        backends[1].record_selected();

        let picked = strategies.select(SelectionStrategy::LeastConnections, &backends, "");
        assert_eq!(picked.id, "b2");
    }

    #[test]
    fn least_connections_ties_break_by_first_occurrence() {
        let strategies = Strategies::new();
        let backends = backends(3);
        let picked = strategies.select(SelectionStrategy::LeastConnections, &backends, "");
        assert_eq!(picked.id, "b0");
    }

    #[test]
    fn ip_hash_is_sticky_for_the_same_ip() {
        let strategies = Strategies::new();
        let backends = backends(4);
        let first = strategies.select(SelectionStrategy::IpHash, &backends, "10.0.0.7").id.clone();
        let second = strategies.select(SelectionStrategy::IpHash, &backends, "10.0.0.7").id.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn ip_hash_with_empty_ip_falls_back_to_round_robin() {
        let rr = Strategies::new();
        let hashed = Strategies::new();
        let backends = backends(3);

        let rr_pick = rr.select(SelectionStrategy::RoundRobin, &backends, "");
        let hash_pick = hashed.select(SelectionStrategy::IpHash, &backends, "");
        assert_eq!(rr_pick.id, hash_pick.id);
    }

    #[test]
    fn weighted_falls_back_to_round_robin_when_total_weight_non_positive() {
        let strategies = Strategies::new();
        let backends = backends(2);
        // weights always floor at 1, so this only exercises the fallback path
        // directly via round robin equivalence when all weights are equal.
        let picked = strategies.select(SelectionStrategy::Weighted, &backends, "");
        assert!(backends.iter().any(|b| b.id == picked.id));
    }

    #[test]
    fn weighted_only_selects_among_given_backends() {
        let strategies = Strategies::new();
        let backends = backends(5);
        for _ in 0..50 {
            let picked = strategies.select(SelectionStrategy::Weighted, &backends, "");
            assert!(backends.iter().any(|b| Arc::ptr_eq(b, &picked)));
        }
    }
}
