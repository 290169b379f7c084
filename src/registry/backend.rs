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

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// An upstream TCP endpoint, real or honeypot.
///
/// Identity fields are immutable; everything that changes after registration
/// is a lock-free atomic so the acceptor, the health checker, and bus
/// subscribers can all read and mutate a shared `Backend` without contending
/// on `Registry`'s list mutex.
#[derive(Debug)]
pub struct Backend {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub is_honeypot: bool,
    pub weight: f64,

    is_healthy: AtomicBool,
    current_clients: AtomicI64,
    total_requests: AtomicU64,
    successful_responses: AtomicU64,
    failed_responses: AtomicU64,
    total_response_time_ms: AtomicU64,
    last_request_time_ms: AtomicI64,
    last_health_check_ms: AtomicI64,
}

impl Backend {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16, is_honeypot: bool, weight: f64) -> Self {
        let now = now_ms();
        Backend {
            id: id.into(),
            host: host.into(),
            port,
            is_honeypot,
            weight: if weight > 0.0 { weight } else { 1.0 },

            is_healthy: AtomicBool::new(true),
            current_clients: AtomicI64::new(0),
            total_requests: AtomicU64::new(0),
            successful_responses: AtomicU64::new(0),
            failed_responses: AtomicU64::new(0),
            total_response_time_ms: AtomicU64::new(0),
            last_request_time_ms: AtomicI64::new(now),
            last_health_check_ms: AtomicI64::new(now),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::Relaxed)
    }

    pub fn current_clients(&self) -> i64 {
        self.current_clients.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn successful_responses(&self) -> u64 {
        self.successful_responses.load(Ordering::Relaxed)
    }

    pub fn failed_responses(&self) -> u64 {
        self.failed_responses.load(Ordering::Relaxed)
    }

    pub fn last_health_check_ms(&self) -> i64 {
        self.last_health_check_ms.load(Ordering::Relaxed)
    }

    /// Sets `is_healthy` and stamps `last_health_check`. Returns the previous
    /// value so callers can detect a transition.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.last_health_check_ms.store(now_ms(), Ordering::Relaxed);
        self.is_healthy.swap(healthy, Ordering::SeqCst)
    }

    /// Records a successful selection: bumps `current_clients` and
    /// `total_requests`, stamps `last_request_time`.
    pub fn record_selected(&self) {
        self.current_clients.fetch_add(1, Ordering::SeqCst);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.last_request_time_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Releases one connection slot acquired by `record_selected`. Never
    /// drives `current_clients` below zero.
    pub fn release(&self) {
        let _ = self
            .current_clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(if v > 0 { v - 1 } else { 0 })
            });
    }

    /// Accounts a `REQUEST_PROCESSED` outcome reported for this backend.
    pub fn record_response(&self, success: bool, response_time_ms: u64) {
        if success {
            self.successful_responses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_responses.fetch_add(1, Ordering::Relaxed);
        }
        self.total_response_time_ms
            .fetch_add(response_time_ms, Ordering::Relaxed);
        self.last_request_time_ms.store(now_ms(), Ordering::Relaxed);
        // A circuit breaker that pauses routing to this backend after
        // repeated failures would hook in here; none is implemented.
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
