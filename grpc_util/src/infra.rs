// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::net::SocketAddr;

use futures::FutureExt;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use tokio::runtime::Builder;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use warp::Filter;

/// Histogram buckets sized for a loopback proxy hop: most forwarded calls
/// complete well under a second, while session startup (environment
/// provisioning, process spawn) can take tens of seconds.
const PROMETHEUS_BUCKETS: &[f64] = &[
    0.001, // 1 ms
    0.005, // 5 ms
    0.010, // 10 ms
    0.025, // 25 ms
    0.050, // 50 ms
    0.100, // 100 ms
    0.250, // 250 ms
    0.5,   // 500 ms
    1.0,   // 1 sec
    2.5,   // 2.5 secs
    5.0,   // 5 secs
    10.0,  // 10 secs
    30.0,  // 30 secs
    60.0,  // 60 secs
];

/// Admin endpoints configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct InfraConfig {
    /// Bind address for the healthz/metricsz endpoints.
    #[serde(default = "default_admin_bind_addr")]
    pub admin_bind_addr: String,
}

impl Default for InfraConfig {
    fn default() -> Self {
        InfraConfig {
            admin_bind_addr: default_admin_bind_addr(),
        }
    }
}

fn default_admin_bind_addr() -> String {
    "0.0.0.0:8010".to_owned()
}

/// Configuration of gRPC-specific server properties.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct GrpcConfig {
    /// Number of in-flight requests allowed inbound per connection.
    pub concurrency_limit_per_connection: Option<usize>,

    /// Max number of HTTP/2 concurrent streams.
    pub max_concurrent_streams: Option<u32>,
}

impl GrpcConfig {
    pub fn apply_to_server(
        &self,
        mut server: tonic::transport::Server,
    ) -> tonic::transport::Server {
        if let Some(limit) = self.concurrency_limit_per_connection {
            server = server.concurrency_limit_per_connection(limit);
        }

        if let Some(limit) = self.max_concurrent_streams {
            server = server.max_concurrent_streams(limit)
        }

        server
    }
}

/// Setup metrics collection and scraping endpoint.
fn setup_metrics_handler() -> Result<PrometheusHandle, String> {
    let recorder = PrometheusBuilder::new()
        .set_buckets(PROMETHEUS_BUCKETS)
        .map_err(|err| format!("Failed to set histogram buckets: {err}"))?
        .build_recorder();
    let handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder))
        .map_err(|err| format!("Failed to install Prometheus metrics recorder: {err}"))?;
    Ok(handle)
}

/// Setup infra endpoints for use by devops systems.
///
/// Returns a `sync::watch` receiver that should be used by all servers as a
/// signal for when they should be shut down, by looking for RecvError when
/// calling `.changed()`.
pub fn setup_infra_endpoints(
    config: InfraConfig,
    run_before_metrics_collection: impl Fn() + Clone + Send + Sync + 'static,
) -> Result<watch::Receiver<()>, String> {
    let metrics_handle = setup_metrics_handler()?;

    let admin_bind_addr: SocketAddr = config
        .admin_bind_addr
        .parse()
        .map_err(|err| format!("Failed to parse admin bind address: {err}"))?;

    // Setup shutdown signal handler.
    let (shutdown_sender, shutdown_receiver) = watch::channel(());

    // Spawn a thread for the admin endpoints to isolate them from the main
    // event loop.
    std::thread::spawn(move || {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("admin")
            .build()
            .expect("initialize admin event loop");

        runtime.block_on(async move {
            let mut sigint_stream = signal(SignalKind::interrupt()).expect("attach SIGINT handler");
            let mut sigterm_stream =
                signal(SignalKind::terminate()).expect("attach SIGTERM handler");
            tokio::spawn(async move {
                futures::future::select(
                    sigint_stream.recv().boxed(),
                    sigterm_stream.recv().boxed(),
                )
                .await;
                log::info!("Received shutdown signal. Starting graceful shutdown ...");
                // This will cause all receivers to get RecvError when calling
                // `.changed()`.
                drop(shutdown_sender);
            });

            let healthz = warp::path("healthz").and(warp::get()).map(|| "OK");

            let metricsz = warp::path("metricsz").and(warp::get()).map(move || {
                run_before_metrics_collection();
                metrics_handle.render()
            });

            warp::serve(healthz.or(metricsz)).bind(admin_bind_addr).await
        });
    });

    Ok(shutdown_receiver)
}
