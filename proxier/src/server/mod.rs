// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use grpc_util::infra::GrpcConfig;
use protos::sessionapi::data_streamer_server::DataStreamerServer;
use protos::sessionapi::driver_api_server::DriverApiServer;
use protos::sessionapi::log_streamer_server::LogStreamerServer;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tonic::{Code, Response, Status};
use tracing::Instrument;

// Modules with the session machinery and the per-service proxies.
pub(crate) mod backend;
pub(crate) mod data_service;
pub(crate) mod driver_service;
pub(crate) mod kv;
pub(crate) mod log_service;
pub(crate) mod manager;
pub(crate) mod ports;
pub(crate) mod runtime_env;

#[cfg(test)]
mod tests;

pub use backend::{BackendHandle, BackendProcess};
pub use kv::{ClusterKv, MemoryKv};
pub use manager::{ClusterBootstrap, JobConfig, RegisterError, SessionManager};
pub use runtime_env::RuntimeEnvProvisioner;

/// Metadata key carrying the per-client identifier on every inbound RPC.
pub const CLIENT_ID_METADATA_KEY: &str = "client_id";

/// Metadata key carrying the stringified reconnect flag on data streams.
pub const RECONNECTING_METADATA_KEY: &str = "reconnecting";

/// TCP port range `[min, max)` from which per-client backend ports are drawn.
#[derive(Clone, Deserialize, Debug)]
pub struct PortRangeConfig {
    #[serde(default = "default_port_min")]
    pub min: u16,
    #[serde(default = "default_port_max")]
    pub max: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        PortRangeConfig {
            min: default_port_min(),
            max: default_port_max(),
        }
    }
}

fn default_port_min() -> u16 {
    23000
}

fn default_port_max() -> u16 {
    24000
}

/// How to launch the per-client backend server process.
#[derive(Clone, Deserialize, Debug)]
pub struct BackendLaunchConfig {
    /// The backend server executable.
    pub program: String,

    /// Extra arguments, inserted before the generated ones (cluster address,
    /// listen port, runtime-env context).
    #[serde(default)]
    pub args: Vec<String>,

    /// Directory receiving per-backend stdout/stderr files.
    pub log_dir: PathBuf,

    /// Substring of the child's command line identifying the backend server
    /// binary. A launcher shim may exec into the real binary; proxying before
    /// that transition breaks the first RPC.
    #[serde(default = "default_ready_match")]
    pub ready_match: String,
}

fn default_ready_match() -> String {
    "session-backend".to_owned()
}

/// Timeouts and retry cadences of the session machinery.
#[derive(Clone, Debug)]
pub struct SessionTimeouts {
    /// How long `channel_for` waits for a backend channel to become ready.
    pub channel_ready: Duration,

    /// How often the reaper sweeps for exited backend processes.
    pub reap_interval: Duration,

    /// How many times the log servicer retries obtaining a channel. Log
    /// streams race the data stream that spawns the backend.
    pub logstream_retries: usize,

    /// Pause between those retries.
    pub logstream_retry_interval: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        SessionTimeouts {
            channel_ready: Duration::from_secs(30),
            reap_interval: Duration::from_secs(30),
            logstream_retries: 5,
            logstream_retry_interval: Duration::from_secs(2),
        }
    }
}

/// A multi-tenant gRPC front-end for remote client drivers.
///
/// `SessionProxy` terminates the three driver-facing services and forwards
/// each client onto a dedicated backend server process owned by the
/// [`SessionManager`].
#[derive(Clone)]
pub struct SessionProxy {
    manager: Arc<SessionManager>,
    kv: Arc<dyn ClusterKv>,
}

impl SessionProxy {
    pub fn new(manager: Arc<SessionManager>, kv: Arc<dyn ClusterKv>) -> SessionProxy {
        SessionProxy { manager, kv }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Stop all sessions: wakes every reconnect-grace sleep and force-kills
    /// every backend server process.
    pub fn shutdown(&self) {
        self.manager.signal_stopped();
        self.manager.shutdown_all();
    }

    pub async fn serve_with_incoming_shutdown<I, IO, IE, F>(
        self,
        incoming: I,
        shutdown_signal: F,
        grpc_config: Option<GrpcConfig>,
    ) -> Result<(), tonic::transport::Error>
    where
        I: Stream<Item = Result<IO, IE>>,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        IE: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
        F: Future<Output = ()>,
    {
        let driver_server = DriverApiServer::new(driver_service::DriverService::new(
            self.manager.clone(),
            self.kv.clone(),
        ));
        let data_server =
            DataStreamerServer::new(data_service::DataService::new(self.manager.clone()));
        let log_server = LogStreamerServer::new(log_service::LogService::new(self.manager.clone()));

        let mut server = Server::builder();
        if let Some(c) = grpc_config.as_ref() {
            server = c.apply_to_server(server);
        }

        server
            .add_service(driver_server)
            .add_service(data_server)
            .add_service(log_server)
            .serve_with_incoming_shutdown(incoming, shutdown_signal)
            .await
    }
}

/// Extract the non-empty client id from request metadata.
pub(crate) fn client_id_from_metadata(metadata: &MetadataMap) -> Option<String> {
    metadata
        .get(CLIENT_ID_METADATA_KEY)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

pub(crate) fn reconnecting_from_metadata(metadata: &MetadataMap) -> bool {
    metadata
        .get(RECONNECTING_METADATA_KEY)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Headers that belong to the inbound transport and must not be replayed on
/// a forwarded request; the client stack sets its own.
const RESERVED_METADATA_KEYS: &[&str] = &[
    "te",
    "content-type",
    "user-agent",
    "host",
    "accept-encoding",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-timeout",
];

/// Clone caller metadata for a forwarded request, dropping transport-level
/// headers.
pub(crate) fn forwarded_metadata(source: &MetadataMap) -> MetadataMap {
    let mut forwarded = MetadataMap::new();
    for entry in source.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                if !RESERVED_METADATA_KEYS.contains(&key.as_str()) {
                    forwarded.insert(key.clone(), value.clone());
                }
            }
            KeyAndValueRef::Binary(key, value) => {
                forwarded.insert_bin(key.clone(), value.clone());
            }
        }
    }
    forwarded
}

pub(crate) fn forwarded_request<T>(metadata: &MetadataMap, message: T) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    *request.metadata_mut() = forwarded_metadata(metadata);
    request
}

/// Adapt an inbound request stream for relaying to a backend, optionally
/// re-heading it with an already-read first message.
///
/// A `Cancelled` item means the caller is already gone; the relayed stream
/// ends cleanly instead of surfacing a spurious error to the backend. Other
/// item errors also end the relay, after logging.
pub(crate) fn relayed_requests<T>(
    mut inbound: tonic::Streaming<T>,
    first: Option<T>,
) -> impl Stream<Item = T> + Send
where
    T: Send + 'static,
{
    async_stream::stream! {
        if let Some(first) = first {
            yield first;
        }
        while let Some(item) = inbound.next().await {
            match item {
                Ok(message) => yield message,
                Err(status) if status.code() == Code::Cancelled => {
                    log::info!("inbound stream cancelled; ending relay");
                    break;
                }
                Err(status) => {
                    log::error!("error on inbound stream: {status}");
                    break;
                }
            }
        }
    }
}

/// Drop guard so the "forward finished" metrics are recorded even when the
/// caller drops its connection mid-call.
struct ForwardGuard {
    service_name: &'static str,
    service_method: &'static str,
    start_time: Instant,
    completed: bool,
}

impl ForwardGuard {
    fn new(service_name: &'static str, service_method: &'static str) -> Self {
        ForwardGuard {
            service_name,
            service_method,
            start_time: Instant::now(),
            completed: false,
        }
    }

    fn complete_for_code(&mut self, code: Code) {
        self.completed = true;

        metrics::histogram!(
            "proxier_forward_handling_seconds",
            self.start_time.elapsed(),
            "grpc_service" => self.service_name,
            "grpc_method" => self.service_method,
        );

        metrics::increment_counter!(
            "proxier_forward_handled_total",
            "grpc_service" => self.service_name,
            "grpc_method" => self.service_method,
            "grpc_code" => status_code_label(code),
        );
    }
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.complete_for_code(Code::Cancelled);
        }
    }
}

fn status_code_label(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Cancelled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// Run one forwarded call against a backend, recording metrics for it.
///
/// NB: deliberately no retry here. Whether a user RPC is safe to reissue is
/// the driver's call to make, not the proxier's.
pub(crate) async fn forward_one<T>(
    f: impl Future<Output = Result<Response<T>, Status>>,
    service_name: &'static str,
    service_method: &'static str,
) -> Result<Response<T>, Status> {
    metrics::increment_counter!(
        "proxier_forward_started_total",
        "grpc_service" => service_name.to_owned(),
        "grpc_method" => service_method.to_owned(),
    );

    let mut guard = ForwardGuard::new(service_name, service_method);

    let result = f
        .instrument(tracing::info_span!(
            "forwarded call",
            grpc_service = service_name,
            grpc_method = service_method,
        ))
        .await;

    let code = result.as_ref().err().map(|s| s.code()).unwrap_or(Code::Ok);
    guard.complete_for_code(code);

    if let Code::Internal | Code::Unknown | Code::Unavailable | Code::ResourceExhausted = code {
        log::error!(
            "unexpected backend error for {}.{}: {:?}",
            service_name,
            service_method,
            result.as_ref().err(),
        );
    }

    result
}
