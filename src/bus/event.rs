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

use serde_json::Value;

/// Recognised bus event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ServiceHealthUpdate,
    RequestClassified,
    RequestProcessed,
    ServiceRegistered,
    RequestRouted,
    NewClientConnection,
    RequestForClassification,
}

impl EventType {
    /// All recognised variants, used to size subscription tables.
    pub const ALL: [EventType; 7] = [
        EventType::ServiceHealthUpdate,
        EventType::RequestClassified,
        EventType::RequestProcessed,
        EventType::ServiceRegistered,
        EventType::RequestRouted,
        EventType::NewClientConnection,
        EventType::RequestForClassification,
    ];
}

/// A typed message carried by the bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub source: String,
    pub id: String,
    pub data: Value,
    pub timestamp_ms: i64,
    pub correlation_id: Option<String>,
}

impl Event {
    /// True when `data.is_request == true`, per the bus's dispatch rule.
    pub fn is_request(&self) -> bool {
        self.data
            .get("is_request")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The `data.correlation_id` field, when this event is carrying a response.
    pub fn response_correlation_id(&self) -> Option<&str> {
        self.data.get("correlation_id").and_then(Value::as_str)
    }
}

/// `(subscription_id, event_type, callback)`. The callback runs on the
/// bus worker thread, serialized per event.
pub struct Subscription {
    pub id: u64,
    pub callback: Box<dyn Fn(&Event) + Send + Sync>,
}
