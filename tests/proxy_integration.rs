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

//! End-to-end scenarios driving the acceptor against a real loopback
//! listener, with classification responses supplied by the test in place
//! of the external classifier.

use heavengate::bus::{EventBus, EventType};
use heavengate::dashboard::Dashboard;
use heavengate::proxy::LoadBalancer;
use heavengate::registry::{Backend, Registry};
use heavengate::stats::{LoadBalancerStats, PerformanceMetrics};
use heavengate::strategy::SelectionStrategy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// An echo backend: everything it reads, it writes straight back. Accepts
/// every incoming connection for the lifetime of the test process.
async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut read_half, mut write_half) = stream.split();
                let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
            });
        }
    });
    addr
}

struct Harness {
    bus: EventBus,
    registry: Arc<Registry>,
    stats: Arc<LoadBalancerStats>,
    addr: std::net::SocketAddr,
    classify_requests: UnboundedReceiver<(String, String)>,
    routed: UnboundedReceiver<(String, bool)>,
}

async fn harness(strategy: SelectionStrategy) -> Harness {
    let bus = EventBus::new(1000);
    bus.start();
    let registry = Arc::new(Registry::new(bus.clone()));
    let dashboard = Arc::new(Dashboard::new("127.0.0.1", 1));
    let stats = Arc::new(LoadBalancerStats::new());

    let (classify_tx, classify_requests) = unbounded_channel();
    bus.subscribe(EventType::RequestForClassification, move |event| {
        let client_ip = event.data.get("client_ip").and_then(|v| v.as_str()).unwrap_or_default();
        let client_id = event.data.get("client_id").and_then(|v| v.as_str()).unwrap_or_default();
        let _ = classify_tx.send((client_id.to_string(), client_ip.to_string()));
    });

    let (routed_tx, routed) = unbounded_channel();
    bus.subscribe(EventType::RequestRouted, move |event| {
        let server_id = event.data.get("server_id").and_then(|v| v.as_str()).unwrap_or_default();
        let is_malicious = event.data.get("is_malicious").and_then(|v| v.as_bool()).unwrap_or_default();
        let _ = routed_tx.send((server_id.to_string(), is_malicious));
    });

    let balancer = LoadBalancer::new(
        registry.clone(),
        bus.clone(),
        strategy,
        dashboard,
        stats.clone(),
        Arc::new(PerformanceMetrics::new()),
    );
    balancer.start();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(balancer.run(listener));

    Harness {
        bus,
        registry,
        stats,
        addr,
        classify_requests,
        routed,
    }
}

async fn connect_and_classify(h: &mut Harness, classification: &str) -> (String, bool) {
    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream.write_all(b"probe").await.unwrap();

    let (client_id, client_ip) = tokio::time::timeout(Duration::from_secs(1), h.classify_requests.recv())
        .await
        .expect("classification request")
        .expect("channel open");

    h.bus.publish(
        EventType::RequestClassified,
        "test-classifier",
        serde_json::json!({
            "client_ip": client_ip,
            "client_id": client_id,
            "classification": classification,
        }),
    );

    let routed = tokio::time::timeout(Duration::from_secs(1), h.routed.recv())
        .await
        .expect("routed event")
        .expect("channel open");

    drop(stream);
    routed
}

#[tokio::test]
async fn three_real_one_honeypot_round_robin_sequence() {
    let mut h = harness(SelectionStrategy::RoundRobin).await;
    h.registry.add_backend(Arc::new(Backend::new("R1", "127.0.0.1", 19001, false, 1.0)));
    h.registry.add_backend(Arc::new(Backend::new("R2", "127.0.0.1", 19002, false, 1.0)));
    h.registry.add_backend(Arc::new(Backend::new("R3", "127.0.0.1", 19003, false, 1.0)));
    h.registry.add_backend(Arc::new(Backend::new("H1", "127.0.0.1", 19004, true, 1.0)));

    let classifications = ["benign", "benign", "benign", "benign", "malicious"];
    let mut sequence = Vec::new();
    for classification in classifications {
        let (server_id, _) = connect_and_classify(&mut h, classification).await;
        sequence.push(server_id);
    }

    assert_eq!(sequence, vec!["R1", "R2", "R3", "R1", "H1"]);
}

#[tokio::test]
async fn second_connection_from_the_same_peer_reuses_the_sticky_backend() {
    let mut h = harness(SelectionStrategy::IpHash).await;
    let r1_addr = spawn_echo_backend().await;
    let r2_addr = spawn_echo_backend().await;
    h.registry
        .add_backend(Arc::new(Backend::new("R1", "127.0.0.1", r1_addr.port(), false, 1.0)));
    h.registry
        .add_backend(Arc::new(Backend::new("R2", "127.0.0.1", r2_addr.port(), false, 1.0)));

    // the first connection must make it all the way to a live backend so the
    // sticky mapping survives `connect_and_relay` instead of being evicted by
    // a connect failure.
    let (first_server, _) = connect_and_classify(&mut h, "benign").await;

    // second connection from the same loopback peer must skip classification
    // entirely and reuse the sticky mapping.
    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream.write_all(b"probe-2").await.unwrap();
    let (second_server, _) = tokio::time::timeout(Duration::from_secs(1), h.routed.recv())
        .await
        .expect("routed event")
        .expect("channel open");
    drop(stream);

    assert_eq!(first_server, second_server);
    assert!(tokio::time::timeout(Duration::from_millis(200), h.classify_requests.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn unhealthy_backend_is_skipped_in_favor_of_the_healthy_one() {
    let mut h = harness(SelectionStrategy::RoundRobin).await;
    h.registry.add_backend(Arc::new(Backend::new("R1", "127.0.0.1", 19021, false, 1.0)));
    h.registry.add_backend(Arc::new(Backend::new("R2", "127.0.0.1", 19022, false, 1.0)));

    h.bus.publish(
        EventType::ServiceHealthUpdate,
        "external-monitor",
        serde_json::json!({ "server_id": "R1", "healthy": false }),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    for _ in 0..5 {
        let (server_id, _) = connect_and_classify(&mut h, "benign").await;
        assert_eq!(server_id, "R2");
    }
}

#[tokio::test]
async fn malicious_classification_with_empty_honeypot_pool_is_a_routing_error() {
    let mut h = harness(SelectionStrategy::RoundRobin).await;
    h.registry.add_backend(Arc::new(Backend::new("R1", "127.0.0.1", 19031, false, 1.0)));
    // no honeypot backends registered

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream.write_all(b"probe").await.unwrap();
    let (client_id, client_ip) = tokio::time::timeout(Duration::from_secs(1), h.classify_requests.recv())
        .await
        .expect("classification request")
        .expect("channel open");

    h.bus.publish(
        EventType::RequestClassified,
        "test-classifier",
        serde_json::json!({ "client_ip": client_ip, "client_id": client_id, "classification": "malicious" }),
    );

    assert!(tokio::time::timeout(Duration::from_millis(300), h.routed.recv()).await.is_err());
    drop(stream);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = h.stats.snapshot(&h.registry.get_stats());
    assert_eq!(snapshot.routing_errors, 1);
    assert_eq!(snapshot.total_requests_processed, 0);
}
