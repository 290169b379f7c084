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

use heavengate::bus::EventBus;
use heavengate::config::Config;
use heavengate::dashboard::Dashboard;
use heavengate::health::HealthChecker;
use heavengate::logging;
use heavengate::proxy::LoadBalancer;
use heavengate::registry::{Backend, Registry};
use heavengate::stats::{LoadBalancerStats, PerformanceMetrics};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[heavengate] configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config);
    log::info!("starting HeavenGate on port {}", config.port);

    let bus = EventBus::new(config.max_bus_queue_size);
    bus.start();

    let dashboard = Arc::new(Dashboard::new(&config.dashboard_host, config.dashboard_port));
    let registry = Arc::new(Registry::new(bus.clone()).with_dashboard(dashboard.clone()));

    for spec in &config.real_backends {
        registry.add_backend(Arc::new(Backend::new(
            spec.id.clone(),
            spec.host.clone(),
            spec.port,
            false,
            spec.weight,
        )));
    }
    for spec in &config.honeypot_backends {
        registry.add_backend(Arc::new(Backend::new(
            spec.id.clone(),
            spec.host.clone(),
            spec.port,
            true,
            spec.weight,
        )));
    }

    let health_checker = Arc::new(HealthChecker::new(
        registry.clone(),
        bus.clone(),
        config.health_check_interval,
    ));
    health_checker.start();

    let balancer = LoadBalancer::new(
        registry.clone(),
        bus.clone(),
        config.strategy,
        dashboard,
        Arc::new(LoadBalancerStats::new()),
        Arc::new(PerformanceMetrics::new()),
    );
    balancer.start();

    let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("failed to bind port {}: {e}", config.port);
            health_checker.stop();
            bus.stop();
            return ExitCode::FAILURE;
        }
    };

    log::info!("listening on 0.0.0.0:{}", config.port);

    let run_result = tokio::select! {
        result = balancer.clone().run(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("received shutdown signal");
            Ok(())
        }
    };

    balancer.stop();
    health_checker.stop();
    bus.stop();

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("proxy loop exited with error: {e}");
            ExitCode::FAILURE
        }
    }
}
