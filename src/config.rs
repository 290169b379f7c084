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

//! Configuration loading. CLI flags override the config file; the
//! config file overrides built-in defaults, mirroring the original's
//! `Argparcer > Confparcer > default` precedence.

use crate::error::ConfigError;
use crate::strategy::SelectionStrategy;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BASE_DIR: &str = "/var/HeavenGate";
const CONFIG_FILE_NAME: &str = "heavengate.conf";

#[derive(Parser, Debug, Default)]
#[command(name = "heavengate", about = "Deception-aware TCP reverse proxy")]
struct CliArgs {
    #[arg(long, env = "HG_PORT")]
    port: Option<u16>,
    #[arg(long, env = "MAX_BUS_QUEUE_SIZE")]
    max_bus_queue_size: Option<usize>,
    #[arg(long, env = "BUS_REQUEST_TIMEOUT")]
    bus_request_timeout: Option<u64>,
    #[arg(long, env = "DASHBOARD_HOST")]
    dashboard_host: Option<String>,
    #[arg(long, env = "DASHBOARD_PORT")]
    dashboard_port: Option<u16>,
    #[arg(long, env = "ENABLE_LOG_FILE")]
    enable_log_file: Option<bool>,
    #[arg(long, env = "LOG_PATH")]
    log_path: Option<String>,
    #[arg(long, env = "ROUTING_STRATEGY")]
    strategy: Option<String>,
    #[arg(long, env = "HEALTH_CHECK_INTERVAL_SECS")]
    health_check_interval_secs: Option<u64>,
    #[arg(long, env = "HG_BASE")]
    config_dir: Option<PathBuf>,
    #[arg(long, env = "REAL_BACKENDS")]
    real_backends: Option<String>,
    #[arg(long, env = "HONEYPOT_BACKENDS")]
    honeypot_backends: Option<String>,
}

/// A backend to register at startup, parsed from `id:host:port:weight`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSpec {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_bus_queue_size: usize,
    pub bus_request_timeout: Duration,
    pub dashboard_host: String,
    pub dashboard_port: u16,
    pub enable_log_file: bool,
    pub log_path: Option<String>,
    pub strategy: SelectionStrategy,
    pub health_check_interval: Duration,
    pub real_backends: Vec<BackendSpec>,
    pub honeypot_backends: Vec<BackendSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 80,
            max_bus_queue_size: crate::bus::DEFAULT_MAX_QUEUE_SIZE,
            bus_request_timeout: Duration::from_secs(1),
            dashboard_host: "127.0.0.1".to_string(),
            dashboard_port: 8081,
            enable_log_file: false,
            log_path: None,
            strategy: SelectionStrategy::RoundRobin,
            health_check_interval: crate::health::DEFAULT_INTERVAL,
            real_backends: vec![
                backend("real-server-1", "127.0.0.1", 8080, 1.0),
                backend("real-server-2", "127.0.0.1", 8081, 1.0),
                backend("real-server-3", "127.0.0.1", 8082, 1.5),
            ],
            honeypot_backends: vec![
                backend("honeypot-1", "127.0.0.1", 9090, 1.0),
                backend("honeypot-2", "127.0.0.1", 9091, 1.0),
            ],
        }
    }
}

fn backend(id: &str, host: &str, port: u16, weight: f64) -> BackendSpec {
    BackendSpec {
        id: id.to_string(),
        host: host.to_string(),
        port,
        weight,
    }
}

impl Config {
    /// Loads configuration from CLI args/env, then the `HG_BASE`-rooted
    /// config file, falling back to built-in defaults.
    ///
    /// A missing config file is tolerated rather than treated as a fatal
    /// startup error: CLI flags and defaults are enough to run standalone.
    /// `ConfigError` is only surfaced for a malformed explicit path or an
    /// unparsable value.
    pub fn load() -> Result<Config, ConfigError> {
        let cli = CliArgs::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Config, ConfigError> {
        let base_dir = cli
            .config_dir
            .clone()
            .or_else(|| std::env::var("HG_BASE").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));

        let file = load_config_file(&base_dir.join(CONFIG_FILE_NAME))?;
        let defaults = Config::default();

        Ok(Config {
            port: resolve(cli.port, &file, "PORT", defaults.port)?,
            max_bus_queue_size: resolve(
                cli.max_bus_queue_size,
                &file,
                "MAX_BUS_QUEUE_SIZE",
                defaults.max_bus_queue_size,
            )?,
            bus_request_timeout: Duration::from_secs(resolve(
                cli.bus_request_timeout,
                &file,
                "BUS_REQUEST_TIMEOUT",
                defaults.bus_request_timeout.as_secs(),
            )?),
            dashboard_host: resolve_string(cli.dashboard_host, &file, "DASHBOARD_HOST", &defaults.dashboard_host),
            dashboard_port: resolve(cli.dashboard_port, &file, "DASHBOARD_PORT", defaults.dashboard_port)?,
            enable_log_file: resolve(cli.enable_log_file, &file, "ENABLE_LOG_FILE", defaults.enable_log_file)?,
            log_path: cli.log_path.or_else(|| file.get("LOG_PATH").cloned()),
            strategy: match cli.strategy.or_else(|| file.get("ROUTING_STRATEGY").cloned()) {
                Some(raw) => parse_strategy(&raw)?,
                None => defaults.strategy,
            },
            health_check_interval: Duration::from_secs(resolve(
                cli.health_check_interval_secs,
                &file,
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval.as_secs(),
            )?),
            real_backends: match cli.real_backends.or_else(|| file.get("REAL_BACKENDS").cloned()) {
                Some(raw) => parse_backend_list(&raw)?,
                None => defaults.real_backends,
            },
            honeypot_backends: match cli.honeypot_backends.or_else(|| file.get("HONEYPOT_BACKENDS").cloned()) {
                Some(raw) => parse_backend_list(&raw)?,
                None => defaults.honeypot_backends,
            },
        })
    }
}

/// Parses `id:host:port:weight[,id:host:port:weight...]`.
fn parse_backend_list(raw: &str) -> Result<Vec<BackendSpec>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').collect();
            let invalid = || ConfigError::InvalidValue {
                key: "BACKENDS".to_string(),
                value: entry.to_string(),
            };
            match parts.as_slice() {
                [id, host, port, weight] => Ok(BackendSpec {
                    id: id.to_string(),
                    host: host.to_string(),
                    port: port.parse().map_err(|_| invalid())?,
                    weight: weight.parse().map_err(|_| invalid())?,
                }),
                _ => Err(invalid()),
            }
        })
        .collect()
}

fn resolve<T>(cli: Option<T>, file: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match file.get(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        }),
        None => Ok(default),
    }
}

fn resolve_string(cli: Option<String>, file: &HashMap<String, String>, key: &str, default: &str) -> String {
    cli.or_else(|| file.get(key).cloned()).unwrap_or_else(|| default.to_string())
}

fn parse_strategy(raw: &str) -> Result<SelectionStrategy, ConfigError> {
    match raw.to_ascii_uppercase().as_str() {
        "ROUND_ROBIN" => Ok(SelectionStrategy::RoundRobin),
        "LEAST_CONNECTIONS" => Ok(SelectionStrategy::LeastConnections),
        "IP_HASH" => Ok(SelectionStrategy::IpHash),
        "WEIGHTED" => Ok(SelectionStrategy::Weighted),
        _ => Err(ConfigError::InvalidValue {
            key: "ROUTING_STRATEGY".to_string(),
            value: raw.to_string(),
        }),
    }
}

/// Parses the newline-delimited `key=value` format: `#` line comments,
/// whitespace-trimmed keys and values, blank lines skipped. A missing file
/// yields an empty map rather than an error.
fn load_config_file(path: &std::path::Path) -> Result<HashMap<String, String>, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => {
            return Err(ConfigError::NotOpened {
                path: path.display().to_string(),
                source: e,
            })
        }
    };

    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            log::warn!("[config] illegal line in config file: '{line}'");
            continue;
        };
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}
