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

//! The Proxy / Acceptor (C5): the TCP accept loop and the per-client state
//! machine that ties the Event Bus, Registry, and Selection Strategies
//! together into a routing decision and a byte relay.

mod relay;

use crate::bus::{EventBus, EventType};
use crate::dashboard::Dashboard;
use crate::error::{ProxyError, RoutingErrorKind};
use crate::registry::{Backend, Registry};
use crate::strategy::{SelectionStrategy, Strategies};
use crate::stats::{LoadBalancerStats, PerformanceMetrics};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const READ_INITIAL_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Benign,
    Malicious,
}

/// The load balancer: owns the accept loop, the classification-resolution
/// subscriber, and the sticky `client_ip -> backend` mapping.
pub struct LoadBalancer {
    registry: Arc<Registry>,
    bus: EventBus,
    strategies: Strategies,
    strategy: SelectionStrategy,
    dashboard: Arc<Dashboard>,
    stats: Arc<LoadBalancerStats>,
    performance: Arc<PerformanceMetrics>,
    sticky: Mutex<HashMap<String, Arc<Backend>>>,
    pending_classifications: Mutex<HashMap<String, oneshot::Sender<Classification>>>,
    subscriptions: Mutex<Vec<u64>>,
    client_seq: AtomicU64,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<Registry>,
        bus: EventBus,
        strategy: SelectionStrategy,
        dashboard: Arc<Dashboard>,
        stats: Arc<LoadBalancerStats>,
        performance: Arc<PerformanceMetrics>,
    ) -> Arc<Self> {
        Arc::new(LoadBalancer {
            registry,
            bus,
            strategies: Strategies::new(),
            strategy,
            dashboard,
            stats,
            performance,
            sticky: Mutex::new(HashMap::new()),
            pending_classifications: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            client_seq: AtomicU64::new(0),
        })
    }

    /// Subscribes to `REQUEST_CLASSIFIED` (resumes the matching client task
    /// by `client_id`, never by raw pointer) and `REQUEST_PROCESSED` (feeds
    /// `Backend::record_response`), before the acceptor binds.
    /// `SERVICE_HEALTH_UPDATE` is owned by the health checker instead of
    /// being subscribed a second time here, since `Registry`'s atomics are
    /// already the single shared source of truth for backend health.
    pub fn start(self: &Arc<Self>) {
        let mut ids = self.subscriptions.lock().unwrap();

        let this = self.clone();
        ids.push(self.bus.subscribe(EventType::RequestClassified, move |event| {
            this.on_request_classified(event);
        }));

        let this = self.clone();
        ids.push(self.bus.subscribe(EventType::RequestProcessed, move |event| {
            this.on_request_processed(event);
        }));
    }

    pub fn stop(&self) {
        for id in self.subscriptions.lock().unwrap().drain(..) {
            self.bus.unsubscribe(id);
        }
    }

    fn on_request_processed(&self, event: &crate::bus::Event) {
        let server_id = event.data.get("server_id").and_then(|v| v.as_str());
        let success = event.data.get("success").and_then(|v| v.as_bool());
        let response_time_ms = event.data.get("response_time_ms").and_then(|v| v.as_u64());
        let (Some(server_id), Some(success), Some(response_time_ms)) = (server_id, success, response_time_ms) else {
            log::warn!("[proxy] malformed REQUEST_PROCESSED event: {:?}", event.data);
            return;
        };
        match self.registry.find(server_id) {
            Some(backend) => backend.record_response(success, response_time_ms),
            None => log::warn!("[proxy] REQUEST_PROCESSED for unknown backend '{server_id}'"),
        }
    }

    fn on_request_classified(&self, event: &crate::bus::Event) {
        let client_id = event.data.get("client_id").and_then(|v| v.as_str());
        let classification = event.data.get("classification").and_then(|v| v.as_str());
        let (Some(client_id), Some(classification)) = (client_id, classification) else {
            log::warn!("[proxy] malformed REQUEST_CLASSIFIED event: {:?}", event.data);
            return;
        };

        let classification = match classification {
            "malicious" => Classification::Malicious,
            "benign" => Classification::Benign,
            other => {
                log::warn!("[proxy] unknown classification '{other}' for client {client_id}");
                return;
            }
        };

        if let Some(sender) = self.pending_classifications.lock().unwrap().remove(client_id) {
            let _ = sender.send(classification);
        }
    }

    /// Runs the accept loop against an already-bound listener. A single
    /// failed `accept` is logged and retried rather than ending the loop;
    /// the caller stops accepting by dropping this future (e.g. racing it
    /// against a shutdown signal in a `tokio::select!`).
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), ProxyError> {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("[proxy] accept failed: {e}");
                    continue;
                }
            };

            let this = self.clone();
            tokio::spawn(async move {
                this.stats.record_connection();
                if let Err(e) = this.handle_client(socket, peer).await {
                    log::warn!("[proxy] client {peer} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_client(self: &Arc<Self>, mut socket: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
        let client_ip = peer.ip().to_string();
        let client_id = self.next_client_id(&client_ip);

        self.bus.publish(
            EventType::NewClientConnection,
            "load_balancer",
            serde_json::json!({
                "client_ip": client_ip,
                "client_id": client_id,
                "timestamp": now_ms(),
            }),
        );

        let sticky_backend = self.sticky.lock().unwrap().get(&client_ip).cloned();
        if let Some(backend) = sticky_backend {
            let is_malicious = backend.is_honeypot;
            let backend = self.route(backend, is_malicious, &client_ip)?;
            return self.connect_and_relay(socket, backend, Vec::new(), &client_ip).await;
        }

        let mut buf = vec![0u8; READ_INITIAL_BUFFER_SIZE];
        let n = socket.read(&mut buf).await.map_err(ProxyError::RelayIo)?;
        buf.truncate(n);

        self.bus.publish(
            EventType::RequestForClassification,
            "load_balancer",
            serde_json::json!({
                "client_ip": client_ip,
                "client_id": client_id,
                "request_data": String::from_utf8_lossy(&buf),
                "timestamp": now_ms(),
            }),
        );

        let (tx, rx) = oneshot::channel();
        self.pending_classifications.lock().unwrap().insert(client_id.clone(), tx);
        let classification = match rx.await {
            Ok(classification) => classification,
            Err(_) => {
                self.pending_classifications.lock().unwrap().remove(&client_id);
                return Ok(());
            }
        };

        let is_malicious = classification == Classification::Malicious;
        let selected = match self.select_backend(is_malicious, &client_ip) {
            Ok(backend) => backend,
            Err(kind) => {
                self.stats.record_routing_error();
                self.performance.record_selection_failure();
                return Err(ProxyError::Routing(kind));
            }
        };

        let backend = self.route(selected, is_malicious, &client_ip)?;
        self.sticky.lock().unwrap().insert(client_ip.clone(), backend.clone());
        self.connect_and_relay(socket, backend, buf, &client_ip).await
    }

    /// The pure selection pipeline: pool lookup, emptiness checks, healthy
    /// snapshot, strategy. Does not mutate any counters.
    fn select_backend(&self, is_malicious: bool, client_ip: &str) -> Result<Arc<Backend>, RoutingErrorKind> {
        if !self.registry.has_backends(is_malicious) {
            return Err(RoutingErrorKind::NoBackendsRegistered);
        }
        let healthy = self.registry.snapshot_healthy(is_malicious);
        if healthy.is_empty() {
            return Err(RoutingErrorKind::NoHealthyBackends);
        }
        Ok(self.strategies.select(self.strategy, &healthy, client_ip))
    }

    /// Final step of the selection pipeline: bookkeeping, `REQUEST_ROUTED`,
    /// and the dashboard notification, timed for `performance.total_routing_time_ns`.
    fn route(&self, backend: Arc<Backend>, is_malicious: bool, client_ip: &str) -> Result<Arc<Backend>, ProxyError> {
        let started = Instant::now();
        backend.record_selected();
        let routing_time_ns = started.elapsed().as_nanos() as u64;

        self.bus.publish(
            EventType::RequestRouted,
            "load_balancer",
            serde_json::json!({
                "client_ip": client_ip,
                "server_id": backend.id,
                "is_malicious": is_malicious,
                "strategy": self.strategy.ordinal(),
                "strategy_name": self.strategy.name(),
                "current_connections": backend.current_clients(),
                "total_requests": backend.total_requests(),
                "routing_time_ns": routing_time_ns,
            }),
        );

        self.dashboard
            .notify_user_registered(client_ip.to_string(), backend.id.clone(), is_malicious);
        self.stats.record_routed(is_malicious, self.strategy);
        self.performance.record_routing_time(routing_time_ns);

        Ok(backend)
    }

    async fn connect_and_relay(
        &self,
        socket: TcpStream,
        backend: Arc<Backend>,
        initial: Vec<u8>,
        client_ip: &str,
    ) -> Result<(), ProxyError> {
        let addr = format!("{}:{}", backend.host, backend.port);
        let result = TcpStream::connect(&addr).await;
        let backend_socket = match result {
            Ok(stream) => stream,
            Err(e) => {
                backend.release();
                self.sticky.lock().unwrap().remove(client_ip);
                return Err(ProxyError::ConnectFailed(e));
            }
        };

        let relay_result = relay::run(socket, backend_socket, initial).await;
        backend.release();

        relay_result.map_err(ProxyError::RelayIo)
    }

    /// `{ip}_{monotonic timestamp}`, plus a sequence number to disambiguate
    /// two connections from the same IP landing in the same nanosecond tick.
    fn next_client_id(&self, client_ip: &str) -> String {
        let seq = self.client_seq.fetch_add(1, Ordering::Relaxed);
        format!("{client_ip}_{}", monotonic_ns() + seq)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn monotonic_ns() -> u64 {
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;

    fn harness() -> (Arc<LoadBalancer>, Arc<Registry>, EventBus) {
        let bus = EventBus::new(1000);
        bus.start();
        let registry = Arc::new(Registry::new(bus.clone()));
        let dashboard = Arc::new(Dashboard::new("127.0.0.1", 1));
        let balancer = LoadBalancer::new(
            registry.clone(),
            bus.clone(),
            SelectionStrategy::RoundRobin,
            dashboard,
            Arc::new(LoadBalancerStats::new()),
            Arc::new(PerformanceMetrics::new()),
        );
        (balancer, registry, bus)
    }

    #[test]
    fn select_backend_reports_no_backends_registered_when_pool_empty() {
        let (balancer, _registry, _bus) = harness();
        let err = balancer.select_backend(false, "10.0.0.1").unwrap_err();
        assert_eq!(err, RoutingErrorKind::NoBackendsRegistered);
    }

    #[test]
    fn select_backend_reports_no_healthy_backends_when_all_unhealthy() {
        let (balancer, registry, _bus) = harness();
        let backend = Arc::new(Backend::new("r1", "127.0.0.1", 9000, false, 1.0));
        backend.set_healthy(false);
        registry.add_backend(backend);

        let err = balancer.select_backend(false, "10.0.0.1").unwrap_err();
        assert_eq!(err, RoutingErrorKind::NoHealthyBackends);
    }

    #[test]
    fn select_backend_round_robins_across_real_pool() {
        let (balancer, registry, _bus) = harness();
        registry.add_backend(Arc::new(Backend::new("r1", "127.0.0.1", 9000, false, 1.0)));
        registry.add_backend(Arc::new(Backend::new("r2", "127.0.0.1", 9001, false, 1.0)));

        let first = balancer.select_backend(false, "").unwrap();
        let second = balancer.select_backend(false, "").unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn route_increments_backend_counters_and_stats() {
        let (balancer, registry, _bus) = harness();
        let backend = Arc::new(Backend::new("r1", "127.0.0.1", 9000, false, 1.0));
        registry.add_backend(backend.clone());

        balancer.route(backend.clone(), false, "10.0.0.1").unwrap();
        assert_eq!(backend.current_clients(), 1);
        assert_eq!(backend.total_requests(), 1);
        assert_eq!(balancer.stats.snapshot(&registry.get_stats()).total_requests_processed, 1);
    }

    #[tokio::test]
    async fn classification_resolution_is_keyed_by_client_id_not_ip() {
        let (balancer, _registry, bus) = harness();
        balancer.start();

        let (tx, rx) = oneshot::channel();
        balancer
            .pending_classifications
            .lock()
            .unwrap()
            .insert("10.0.0.1_123_0".to_string(), tx);

        bus.publish(
            EventType::RequestClassified,
            "classifier",
            serde_json::json!({
                "client_ip": "10.0.0.1",
                "client_id": "10.0.0.1_123_0",
                "classification": "malicious",
            }),
        );

        let classification = rx.await.unwrap();
        assert_eq!(classification, Classification::Malicious);
        balancer.stop();
    }
}
