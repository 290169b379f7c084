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

//! Outbound notifications to the dashboard (an external collaborator, out
//! of scope for this crate beyond this thin client). Every call is
//! fire-and-forget: failures are logged and otherwise ignored, and nothing
//! here ever blocks the caller past spawning the request.

use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct Dashboard {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct UserRegisteredPayload<'a> {
    #[serde(rename = "ClientIP")]
    client_ip: &'a str,
    #[serde(rename = "Path")]
    path: &'a str,
    #[serde(rename = "IsMalicious")]
    is_malicious: bool,
    #[serde(rename = "Timestamp")]
    timestamp: String,
}

#[derive(Serialize)]
struct AgentChangePayload {
    #[serde(rename = "RealCount")]
    real_count: usize,
    #[serde(rename = "HoneypotCount")]
    honeypot_count: usize,
}

impl Dashboard {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Dashboard {
            client: reqwest::Client::new(),
            base_url: format!("http://{}:{}", host.as_ref(), port),
        }
    }

    /// Notifies the dashboard that a client connection was routed.
    /// Dispatched as a detached task; the caller does not wait on the
    /// result.
    pub fn notify_user_registered(self: &Arc<Self>, client_ip: String, path: String, is_malicious: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            let payload = UserRegisteredPayload {
                client_ip: &client_ip,
                path: &path,
                is_malicious,
                timestamp: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            };
            this.post("/api/user_registered", &payload).await;
        });
    }

    /// Notifies the dashboard of the updated backend counts.
    /// `Registry::add_backend` fires this after every successful
    /// registration.
    pub fn notify_agent_change(self: &Arc<Self>, real_count: usize, honeypot_count: usize) {
        let this = self.clone();
        tokio::spawn(async move {
            let payload = AgentChangePayload {
                real_count,
                honeypot_count,
            };
            this.post("/api/agent_change", &payload).await;
        });
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, payload: &T) {
        let url = format!("{}{}", self.base_url, path);
        match self.client.post(&url).json(payload).send().await {
            Ok(response) if !response.status().is_success() => {
                log::warn!("[dashboard] {} returned {}", url, response.status());
            }
            Ok(_) => {}
            Err(e) => log::warn!("[dashboard] failed to reach {}: {}", url, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_composed_from_host_and_port() {
        let dashboard = Dashboard::new("10.0.0.9", 9999);
        assert_eq!(dashboard.base_url, "http://10.0.0.9:9999");
    }

    #[tokio::test]
    async fn post_to_unreachable_host_does_not_panic() {
        let dashboard = Arc::new(Dashboard::new("127.0.0.1", 1));
        dashboard.notify_user_registered("1.2.3.4".to_string(), "/".to_string(), false);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
