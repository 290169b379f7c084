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

use std::sync::atomic::{AtomicU64, Ordering};

/// Internal, lock-free counters backing `EventBus::get_metrics`.
#[derive(Default)]
pub struct BusMetricsInternal {
    pub events_published: AtomicU64,
    pub events_processed: AtomicU64,
    /// Events evicted from the queue before a worker ever saw them. Currently
    /// this only happens on overflow, so it tracks `queue_overflow` exactly;
    /// kept distinct in case a future drop path (e.g. a poisoned worker) needs
    /// to contribute to it without also being counted as an overflow.
    pub events_dropped: AtomicU64,
    pub handler_errors: AtomicU64,
    pub queue_overflow: AtomicU64,
}

/// Point-in-time snapshot returned by `EventBus::get_metrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusMetricsSnapshot {
    pub events_published: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub handler_errors: u64,
    pub queue_size: u64,
    pub queue_overflow: u64,
}

impl BusMetricsInternal {
    pub fn snapshot(&self, queue_size: u64) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            queue_size,
            queue_overflow: self.queue_overflow.load(Ordering::Relaxed),
        }
    }
}
