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

//! The Event Bus (C1): a typed, in-process pub/sub broker with a bounded
//! queue, request/response correlation, and metrics.
//!
//! The worker runs on its own dedicated thread, serialized per event, exactly
//! as the original `DataBus` drove subscriber callbacks from a single worker
//! thread parked on a condition variable.

mod event;
mod metrics;

pub use event::{Event, EventType, Subscription};
pub use metrics::BusMetricsSnapshot;

use metrics::BusMetricsInternal;

use crate::error::BusError;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default bound on the event queue.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100_000;

type PendingSender = mpsc::Sender<Result<Value, BusError>>;

struct Inner {
    events: Mutex<VecDeque<Event>>,
    events_cv: Condvar,
    subscriptions: Mutex<HashMap<EventType, Vec<Arc<Subscription>>>>,
    pending_requests: Mutex<HashMap<String, PendingSender>>,
    worker: Mutex<Option<JoinHandle<()>>>,

    running: AtomicBool,
    max_queue_size: usize,

    next_subscription_id: AtomicU64,
    next_event_id: AtomicU64,
    next_correlation_id: AtomicU64,

    metrics: BusMetricsInternal,
}

/// A process-wide, typed pub/sub broker. Cheaply `Clone`-able; every clone
/// shares the same queue, subscriptions, and worker thread.
#[derive(Clone)]
pub struct EventBus(Arc<Inner>);

impl EventBus {
    pub fn new(max_queue_size: usize) -> Self {
        EventBus(Arc::new(Inner {
            events: Mutex::new(VecDeque::new()),
            events_cv: Condvar::new(),
            subscriptions: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
            running: AtomicBool::new(false),
            max_queue_size,
            next_subscription_id: AtomicU64::new(1),
            next_event_id: AtomicU64::new(1),
            next_correlation_id: AtomicU64::new(1),
            metrics: BusMetricsInternal::default(),
        }))
    }

    /// Starts the worker thread. Idempotent: a second call is a no-op.
    pub fn start(&self) {
        if self
            .0
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let inner = self.0.clone();
        let handle = std::thread::Builder::new()
            .name("heavengate-bus".to_string())
            .spawn(move || Self::run_worker(inner))
            .expect("failed to spawn bus worker thread");

        *self.0.worker.lock().unwrap() = Some(handle);
        log::info!("[bus] worker started");
    }

    /// Stops the worker thread and fails every pending request. Idempotent.
    pub fn stop(&self) {
        if self
            .0
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.0.events_cv.notify_all();

        let handle = self.0.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        log::info!("[bus] worker stopped");
    }

    /// Enqueues an event. Never fails: under overload the oldest queued event
    /// is dropped, bumping both `queue_overflow` and `events_dropped`.
    pub fn publish(&self, event_type: EventType, source: &str, data: Value) {
        let correlation_id = data
            .get("correlation_id")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let event = Event {
            event_type,
            source: source.to_string(),
            id: format!("evt_{}", self.0.next_event_id.fetch_add(1, Ordering::Relaxed)),
            data,
            timestamp_ms: now_ms(),
            correlation_id,
        };

        {
            let mut queue = self.0.events.lock().unwrap();
            if queue.len() >= self.0.max_queue_size {
                queue.pop_front();
                self.0.metrics.queue_overflow.fetch_add(1, Ordering::Relaxed);
                self.0.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("[bus] queue overflow, dropping oldest event");
            }
            queue.push_back(event);
        }
        self.0.events_cv.notify_one();
        self.0.metrics.events_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Registers a callback for a single event type. The callback runs on the
    /// worker thread, serialized per event.
    pub fn subscribe<F>(&self, event_type: EventType, callback: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.0.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscription {
            id,
            callback: Box::new(callback),
        });
        self.0
            .subscriptions
            .lock()
            .unwrap()
            .entry(event_type)
            .or_default()
            .push(sub);
        id
    }

    /// Removes the subscription with matching id from every type bucket.
    /// Idempotent; silent if absent.
    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.0.subscriptions.lock().unwrap();
        for bucket in subs.values_mut() {
            bucket.retain(|s| s.id != id);
        }
    }

    /// Synchronous request/response: publishes `type` with a fresh
    /// correlation id and blocks up to `timeout` for a matching response
    /// event to arrive.
    pub fn request(
        &self,
        event_type: EventType,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let correlation_id = format!(
            "corr_{}",
            self.0.next_correlation_id.fetch_add(1, Ordering::Relaxed)
        );

        let (tx, rx) = mpsc::channel();
        self.0
            .pending_requests
            .lock()
            .unwrap()
            .insert(correlation_id.clone(), tx);

        self.publish(
            event_type,
            "requestor",
            serde_json::json!({
                "data": data,
                "correlation_id": correlation_id,
                "is_request": true,
            }),
        );

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => {
                self.0.pending_requests.lock().unwrap().remove(&correlation_id);
                Err(BusError::RequestTimeout)
            }
        }
    }

    pub fn get_metrics(&self) -> BusMetricsSnapshot {
        let queue_size = self.0.events.lock().unwrap().len() as u64;
        self.0.metrics.snapshot(queue_size)
    }

    fn run_worker(inner: Arc<Inner>) {
        loop {
            let event = {
                let mut queue = inner.events.lock().unwrap();
                loop {
                    if !inner.running.load(Ordering::SeqCst) {
                        Self::cleanup(&inner);
                        return;
                    }
                    if let Some(event) = queue.pop_front() {
                        break event;
                    }
                    queue = inner.events_cv.wait(queue).unwrap();
                }
            };

            Self::handle_event(&inner, &event);
            inner.metrics.events_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn handle_event(inner: &Arc<Inner>, event: &Event) {
        if !event.is_request() {
            if let Some(corr_id) = event.response_correlation_id() {
                let sender = inner.pending_requests.lock().unwrap().remove(corr_id);
                if let Some(sender) = sender {
                    let _ = sender.send(Ok(event.data.clone()));
                }
                return;
            }
        }

        let subscribers = {
            let subs = inner.subscriptions.lock().unwrap();
            subs.get(&event.event_type).cloned().unwrap_or_default()
        };

        for subscriber in subscribers {
            let result = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(event)));
            if result.is_err() {
                inner.metrics.handler_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("[bus] subscriber for {:?} panicked", event.event_type);
            }
        }
    }

    fn cleanup(inner: &Arc<Inner>) {
        let mut pending = inner.pending_requests.lock().unwrap();
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(BusError::BusShutdown));
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn publish_before_start_then_drain_counts_correctly() {
        let bus = EventBus::new(4);
        for i in 0..6 {
            bus.publish(
                EventType::ServiceRegistered,
                "test",
                serde_json::json!({ "i": i }),
            );
        }
        let metrics = bus.get_metrics();
        assert_eq!(metrics.events_published, 6);
        assert_eq!(metrics.queue_overflow, 2);
        assert_eq!(metrics.events_dropped, 2);
        assert_eq!(metrics.queue_size, 4);

        bus.start();
        std::thread::sleep(Duration::from_millis(100));
        let metrics = bus.get_metrics();
        assert_eq!(metrics.events_processed, 4);
        assert_eq!(metrics.queue_overflow, 2);
        assert_eq!(metrics.events_dropped, 2);
        assert_eq!(metrics.events_published, 6);
        bus.stop();
    }

    #[test]
    fn subscribe_unsubscribe_stops_delivery() {
        let bus = EventBus::new(DEFAULT_MAX_QUEUE_SIZE);
        bus.start();

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = bus.subscribe(EventType::ServiceRegistered, move |_evt| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(EventType::ServiceRegistered, "t", serde_json::json!({}));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.unsubscribe(id);
        bus.unsubscribe(id); // idempotent

        bus.publish(EventType::ServiceRegistered, "t", serde_json::json!({}));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.stop();
    }

    #[test]
    fn start_is_idempotent() {
        let bus = EventBus::new(DEFAULT_MAX_QUEUE_SIZE);
        bus.start();
        bus.start();
        assert!(bus.0.worker.lock().unwrap().is_some());
        bus.stop();
    }

    #[test]
    fn request_times_out_without_a_responder() {
        let bus = EventBus::new(DEFAULT_MAX_QUEUE_SIZE);
        bus.start();

        let start = std::time::Instant::now();
        let result = bus.request(
            EventType::RequestForClassification,
            serde_json::json!({}),
            Duration::from_millis(50),
        );
        let elapsed = start.elapsed();

        assert_eq!(result, Err(BusError::RequestTimeout));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(200));
        assert!(bus.0.pending_requests.lock().unwrap().is_empty());

        bus.stop();
    }

    #[test]
    fn request_resolves_when_a_response_is_published() {
        let bus = EventBus::new(DEFAULT_MAX_QUEUE_SIZE);
        bus.start();

        let responder_bus = bus.clone();
        bus.subscribe(EventType::RequestForClassification, move |evt| {
            if let Some(corr_id) = evt.data.get("correlation_id").and_then(|v| v.as_str()) {
                responder_bus.publish(
                    EventType::RequestClassified,
                    "classifier",
                    serde_json::json!({ "correlation_id": corr_id, "classification": "benign" }),
                );
            }
        });

        let result = bus
            .request(
                EventType::RequestForClassification,
                serde_json::json!({ "client_ip": "10.0.0.1" }),
                Duration::from_millis(500),
            )
            .unwrap();

        assert_eq!(result["classification"], "benign");
        bus.stop();
    }

    #[test]
    fn stop_fails_pending_requests_with_shutdown() {
        let bus = EventBus::new(DEFAULT_MAX_QUEUE_SIZE);
        bus.start();

        let bus2 = bus.clone();
        let handle = std::thread::spawn(move || {
            bus2.request(
                EventType::RequestForClassification,
                serde_json::json!({}),
                Duration::from_secs(5),
            )
        });

        std::thread::sleep(Duration::from_millis(50));
        bus.stop();

        let result = handle.join().unwrap();
        assert_eq!(result, Err(BusError::BusShutdown));
    }

    #[test]
    fn handler_panic_does_not_kill_the_worker() {
        let bus = EventBus::new(DEFAULT_MAX_QUEUE_SIZE);
        bus.start();

        bus.subscribe(EventType::ServiceRegistered, |_evt| {
            panic!("boom");
        });

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(EventType::RequestRouted, move |_evt| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(EventType::ServiceRegistered, "t", serde_json::json!({}));
        std::thread::sleep(Duration::from_millis(50));
        bus.publish(EventType::RequestRouted, "t", serde_json::json!({}));
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.get_metrics().handler_errors, 1);

        bus.stop();
    }
}
