// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Arg, Command};
use grpc_util::infra::setup_infra_endpoints;
use grpc_util::logging::setup_logging;
use proxier::{MemoryKv, RuntimeEnvProvisioner, SessionManager, SessionProxy};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

mod config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("session_proxier")
        .arg(
            Arg::new("config")
                .short('c')
                .required(true)
                .value_name("FILE"),
        )
        .get_matches();

    let config = {
        let filename = matches.get_one::<String>("config").unwrap();
        let config_content = tokio::fs::read_to_string(&filename)
            .await
            .map_err(|err| format!("Failed to read config from {}: {}", &filename, err))?;
        config::Config::from_str(&config_content)?
    };

    setup_logging("proxier_server");
    log::info!("session proxier config: {config:?}");

    let provisioner = config
        .runtime_env_agent_address
        .as_deref()
        .map(RuntimeEnvProvisioner::new);

    let manager = SessionManager::new(
        config.cluster_address,
        None,
        config.backend,
        config.port_range,
        config
            .timeouts
            .map(|t| t.into_session_timeouts())
            .unwrap_or_default(),
        provisioner,
    )?;

    // Pre-session KV requests are answered from an in-process store; a
    // cluster-backed store can be wired in behind the same trait.
    let proxy = SessionProxy::new(manager.clone(), Arc::new(MemoryKv::default()));

    let gauge_manager = manager.clone();
    let mut shutdown_receiver =
        setup_infra_endpoints(config.infra.unwrap_or_default(), move || {
            metrics::gauge!(
                "proxier_active_sessions",
                gauge_manager.num_clients() as f64
            );
            metrics::gauge!("proxier_free_ports", gauge_manager.free_port_count() as f64);
        })?;

    let address: SocketAddr = config.listen_address.parse()?;
    let listener = TcpListener::bind(address).await?;
    log::info!("serving the session proxier on {address}");

    let serve_result = proxy
        .clone()
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            async move { while shutdown_receiver.changed().await.is_ok() {} },
            config.grpc,
        )
        .await;

    // Wake lingering grace-period sleeps and force-kill every backend before
    // exiting; kill-on-drop covers crashes on platforms with fate sharing.
    proxy.shutdown();

    serve_result?;
    Ok(())
}
