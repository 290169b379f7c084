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

//! The Backend Registry (C2): the shared, thread-safe set of backend records.

mod backend;

pub use backend::Backend;

use crate::bus::{EventBus, EventType};
use crate::dashboard::Dashboard;
use std::sync::{Arc, Mutex};

/// Two disjoint pools of backends, under a single mutex for list mutation.
/// Per-backend fields are lock-free atomics and may be read or mutated
/// without holding this lock.
struct Lists {
    real: Vec<Arc<Backend>>,
    honeypot: Vec<Arc<Backend>>,
}

pub struct Registry {
    lists: Mutex<Lists>,
    bus: EventBus,
    dashboard: Option<Arc<Dashboard>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    pub total_real_backends: usize,
    pub total_honeypot_backends: usize,
    pub healthy_real_backends: usize,
    pub healthy_honeypot_backends: usize,
}

impl Registry {
    pub fn new(bus: EventBus) -> Self {
        Registry {
            lists: Mutex::new(Lists {
                real: Vec::new(),
                honeypot: Vec::new(),
            }),
            bus,
            dashboard: None,
        }
    }

    /// Attaches a dashboard handle so `add_backend` can report updated
    /// backend counts. Without one, registration still works; the
    /// notification is simply skipped.
    pub fn with_dashboard(mut self, dashboard: Arc<Dashboard>) -> Self {
        self.dashboard = Some(dashboard);
        self
    }

    /// Appends to the appropriate pool based on `is_honeypot` and publishes
    /// `SERVICE_REGISTERED`. A duplicate id is rejected as a no-op warning
    /// rather than accepted.
    pub fn add_backend(&self, backend: Arc<Backend>) -> bool {
        let (real_count, honeypot_count) = {
            let mut lists = self.lists.lock().unwrap();
            if lists.real.iter().chain(lists.honeypot.iter()).any(|b| b.id == backend.id) {
                log::warn!("[registry] duplicate backend id '{}', ignoring", backend.id);
                return false;
            }

            if backend.is_honeypot {
                lists.honeypot.push(backend.clone());
            } else {
                lists.real.push(backend.clone());
            }
            (lists.real.len(), lists.honeypot.len())
        };

        self.bus.publish(
            EventType::ServiceRegistered,
            "load_balancer",
            serde_json::json!({
                "server_id": backend.id,
                "host": backend.host,
                "port": backend.port,
                "is_honeypot": backend.is_honeypot,
                "weight": backend.weight,
            }),
        );

        if let Some(dashboard) = &self.dashboard {
            dashboard.notify_agent_change(real_count, honeypot_count);
        }

        log::info!(
            "[registry] registered {}:{} (honeypot: {})",
            backend.host,
            backend.port,
            backend.is_honeypot
        );

        true
    }

    /// Finds the backend by id across both lists and releases one connection
    /// slot. Silent if not found.
    pub fn release_backend(&self, id: &str) {
        let lists = self.lists.lock().unwrap();
        if let Some(backend) = lists.real.iter().chain(lists.honeypot.iter()).find(|b| b.id == id) {
            backend.release();
        }
    }

    /// Returns a fresh vector of shared references to backends in the
    /// requested pool whose `is_healthy` is true at the time of the call.
    pub fn snapshot_healthy(&self, is_malicious: bool) -> Vec<Arc<Backend>> {
        let lists = self.lists.lock().unwrap();
        let pool = if is_malicious { &lists.honeypot } else { &lists.real };
        pool.iter().filter(|b| b.is_healthy()).cloned().collect()
    }

    /// True when the requested pool has at least one registered backend.
    pub fn has_backends(&self, is_malicious: bool) -> bool {
        let lists = self.lists.lock().unwrap();
        if is_malicious {
            !lists.honeypot.is_empty()
        } else {
            !lists.real.is_empty()
        }
    }

    /// Finds a backend by id across both pools, for handlers keyed by
    /// `server_id` (health updates, response metrics).
    pub fn find(&self, id: &str) -> Option<Arc<Backend>> {
        let lists = self.lists.lock().unwrap();
        lists
            .real
            .iter()
            .chain(lists.honeypot.iter())
            .find(|b| b.id == id)
            .cloned()
    }

    /// All registered backends across both pools, for the health checker's
    /// sweep.
    pub fn all(&self) -> Vec<Arc<Backend>> {
        let lists = self.lists.lock().unwrap();
        lists.real.iter().chain(lists.honeypot.iter()).cloned().collect()
    }

    pub fn get_stats(&self) -> RegistryStats {
        let lists = self.lists.lock().unwrap();
        RegistryStats {
            total_real_backends: lists.real.len(),
            total_honeypot_backends: lists.honeypot.len(),
            healthy_real_backends: lists.real.iter().filter(|b| b.is_healthy()).count(),
            healthy_honeypot_backends: lists.honeypot.iter().filter(|b| b.is_healthy()).count(),
        }
    }
}
