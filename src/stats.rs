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

//! Aggregate counters for the load balancer and the routing-latency
//! histogram backing them. Every field is a lock-free atomic so the proxy's
//! hot path never blocks on stats bookkeeping.

use crate::registry::RegistryStats;
use crate::strategy::SelectionStrategy;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

pub struct LoadBalancerStats {
    total_requests_processed: AtomicU64,
    requests_routed_to_real: AtomicU64,
    requests_routed_to_honeypot: AtomicU64,
    routing_errors: AtomicU64,
    total_connections: AtomicU64,
    strategy_usage: [AtomicU64; 4],
    start: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadBalancerStatsSnapshot {
    pub total_requests_processed: u64,
    pub requests_routed_to_real: u64,
    pub requests_routed_to_honeypot: u64,
    pub routing_errors: u64,
    pub total_connections: u64,
    pub total_real_backends: usize,
    pub total_honeypot_backends: usize,
    pub healthy_real_backends: usize,
    pub healthy_honeypot_backends: usize,
    pub uptime_secs: u64,
    pub strategy_usage: [u64; 4],
}

impl Default for LoadBalancerStats {
    fn default() -> Self {
        LoadBalancerStats {
            total_requests_processed: AtomicU64::new(0),
            requests_routed_to_real: AtomicU64::new(0),
            requests_routed_to_honeypot: AtomicU64::new(0),
            routing_errors: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            strategy_usage: Default::default(),
            start: Instant::now(),
        }
    }
}

impl LoadBalancerStats {
    pub fn new() -> Self {
        LoadBalancerStats::default()
    }

    pub fn record_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed routing decision: one of the real/honeypot
    /// counters, the total, and the strategy-usage bucket used for it.
    pub fn record_routed(&self, is_honeypot: bool, strategy: SelectionStrategy) {
        self.total_requests_processed.fetch_add(1, Ordering::Relaxed);
        if is_honeypot {
            self.requests_routed_to_honeypot.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_routed_to_real.fetch_add(1, Ordering::Relaxed);
        }
        self.strategy_usage[strategy.ordinal() as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routing_error(&self) {
        self.routing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, registry: &RegistryStats) -> LoadBalancerStatsSnapshot {
        LoadBalancerStatsSnapshot {
            total_requests_processed: self.total_requests_processed.load(Ordering::Relaxed),
            requests_routed_to_real: self.requests_routed_to_real.load(Ordering::Relaxed),
            requests_routed_to_honeypot: self.requests_routed_to_honeypot.load(Ordering::Relaxed),
            routing_errors: self.routing_errors.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_real_backends: registry.total_real_backends,
            total_honeypot_backends: registry.total_honeypot_backends,
            healthy_real_backends: registry.healthy_real_backends,
            healthy_honeypot_backends: registry.healthy_honeypot_backends,
            uptime_secs: self.start.elapsed().as_secs(),
            strategy_usage: [
                self.strategy_usage[0].load(Ordering::Relaxed),
                self.strategy_usage[1].load(Ordering::Relaxed),
                self.strategy_usage[2].load(Ordering::Relaxed),
                self.strategy_usage[3].load(Ordering::Relaxed),
            ],
        }
    }
}

/// Running totals behind the routing-latency figures an operator cares
/// about: mean routing time and how often selection failed outright.
#[derive(Default)]
pub struct PerformanceMetrics {
    total_routing_time_ns: AtomicU64,
    total_routing_operations: AtomicU64,
    backend_selection_failures: AtomicU64,
    last_routing_time_ns: AtomicI64,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        PerformanceMetrics::default()
    }

    pub fn record_routing_time(&self, elapsed_ns: u64) {
        self.total_routing_time_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
        self.total_routing_operations.fetch_add(1, Ordering::Relaxed);
        self.last_routing_time_ns.store(elapsed_ns as i64, Ordering::Relaxed);
    }

    pub fn record_selection_failure(&self) {
        self.backend_selection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mean_routing_time_ns(&self) -> f64 {
        let ops = self.total_routing_operations.load(Ordering::Relaxed);
        if ops == 0 {
            return 0.0;
        }
        self.total_routing_time_ns.load(Ordering::Relaxed) as f64 / ops as f64
    }

    pub fn backend_selection_failures(&self) -> u64 {
        self.backend_selection_failures.load(Ordering::Relaxed)
    }
}
