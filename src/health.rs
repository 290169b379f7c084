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

//! The Health Checker (C4): a periodic TCP-probe worker on its own thread.

use crate::bus::{EventBus, EventType};
use crate::registry::Registry;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

pub struct HealthChecker {
    registry: Arc<Registry>,
    bus: EventBus,
    interval: Duration,
    running: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
    subscription_id: Mutex<Option<u64>>,
}

impl HealthChecker {
    pub fn new(registry: Arc<Registry>, bus: EventBus, interval: Duration) -> Self {
        HealthChecker {
            registry,
            bus,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            wake: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
            subscription_id: Mutex::new(None),
        }
    }

    /// Starts the probe loop and subscribes to externally-published
    /// `SERVICE_HEALTH_UPDATE` events, which overwrite local `is_healthy`
    /// for the named `server_id` without contending with the probe cadence
    ///.
    pub fn start(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let registry = self.registry.clone();
        let id = self.bus.subscribe(EventType::ServiceHealthUpdate, move |event| {
            let server_id = event.data.get("server_id").and_then(|v| v.as_str());
            let healthy = event.data.get("healthy").and_then(|v| v.as_bool());
            if let (Some(server_id), Some(healthy)) = (server_id, healthy) {
                if let Some(backend) = registry.find(server_id) {
                    backend.set_healthy(healthy);
                }
            }
        });
        *self.subscription_id.lock().unwrap() = Some(id);

        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("heavengate-health".to_string())
            .spawn(move || this.run())
            .expect("failed to spawn health checker thread");
        *self.thread.lock().unwrap() = Some(handle);
        log::info!("[health] checker started, interval {:?}", self.interval);
    }

    /// Stops the probe loop and joins its thread. Idempotent.
    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        {
            let (lock, cvar) = &*self.wake;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }

        if let Some(id) = self.subscription_id.lock().unwrap().take() {
            self.bus.unsubscribe(id);
        }

        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        log::info!("[health] checker stopped");
    }

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            self.perform_health_checks();
            self.sleep_or_wake();
        }
    }

    fn sleep_or_wake(&self) {
        let (lock, cvar) = &*self.wake;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait_timeout_while(guard, self.interval, |woken| !*woken);
    }

    fn perform_health_checks(&self) {
        for backend in self.registry.all() {
            let was_healthy = backend.is_healthy();
            let is_healthy = Self::probe(&backend.host, backend.port);
            let previous = backend.set_healthy(is_healthy);
            debug_assert_eq!(previous, was_healthy);

            if was_healthy != is_healthy {
                self.bus.publish(
                    EventType::ServiceHealthUpdate,
                    "load_balancer",
                    serde_json::json!({
                        "server_id": backend.id,
                        "host": backend.host,
                        "port": backend.port,
                        "is_honeypot": backend.is_honeypot,
                        "healthy": is_healthy,
                        "current_connections": backend.current_clients(),
                    }),
                );
                log::info!(
                    "[health] backend {} health changed: {}",
                    backend.id,
                    if is_healthy { "healthy" } else { "unhealthy" }
                );
            }
        }
    }

    fn probe(host: &str, port: u16) -> bool {
        let addr = match (host, port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next(),
            Err(_) => None,
        };
        match addr {
            Some(addr) => TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Backend;
    use std::net::TcpListener;

    fn bus() -> EventBus {
        let bus = EventBus::new(1000);
        bus.start();
        bus
    }

    #[test]
    fn probe_succeeds_against_a_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(HealthChecker::probe("127.0.0.1", port));
    }

    #[test]
    fn probe_fails_against_a_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!HealthChecker::probe("127.0.0.1", port));
    }

    #[test]
    fn external_health_update_overwrites_local_state() {
        let bus = bus();
        let registry = Arc::new(Registry::new(bus.clone()));
        let backend = Arc::new(Backend::new("r1", "127.0.0.1", 1, false, 1.0));
        registry.add_backend(backend.clone());

        let checker = Arc::new(HealthChecker::new(registry.clone(), bus.clone(), Duration::from_secs(3600)));
        checker.start();

        bus.publish(
            EventType::ServiceHealthUpdate,
            "external-monitor",
            serde_json::json!({ "server_id": "r1", "healthy": false }),
        );
        std::thread::sleep(Duration::from_millis(100));
        assert!(!backend.is_healthy());

        checker.stop();
    }
}
