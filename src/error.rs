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

//! Error taxonomy for the balancer, shared across the bus, registry, and proxy.

use thiserror::Error;

/// Errors raised by configuration loading. Fatal at startup; the caller exits 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file at {path}: {source}")]
    NotOpened {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid value for setting '{key}': '{value}'")]
    InvalidValue { key: String, value: String },
}

/// Errors surfaced by `EventBus::request`.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BusError {
    #[error("request timed out waiting for a response")]
    RequestTimeout,
    #[error("bus was stopped while a request was pending")]
    BusShutdown,
}

/// Kinds of routing failure. Reported via metrics and logs; never thrown
/// across thread boundaries.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum RoutingErrorKind {
    #[error("no backends registered for this pool")]
    NoBackendsRegistered,
    #[error("no healthy backends available in this pool")]
    NoHealthyBackends,
}

/// Transient errors encountered while driving a client connection. All are
/// logged at WARN and close only the affected connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connect to backend failed: {0}")]
    ConnectFailed(#[source] std::io::Error),
    #[error("relay I/O error: {0}")]
    RelayIo(#[source] std::io::Error),
    #[error("routing failed: {0}")]
    Routing(RoutingErrorKind),
}
