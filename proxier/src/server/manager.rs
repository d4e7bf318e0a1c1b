// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use grpc_util::backend::{loopback_channel, wait_until_ready};
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::{watch, OnceCell};
use tonic::transport::Channel;

use crate::server::backend::{BackendHandle, BackendProcess};
use crate::server::ports::PortPool;
use crate::server::runtime_env::RuntimeEnvProvisioner;
use crate::server::{BackendLaunchConfig, PortRangeConfig, SessionTimeouts};

/// How often to re-inspect a freshly spawned child while waiting for its
/// launcher shim to exec into the backend server binary.
#[cfg(target_os = "linux")]
const EXEC_TRANSITION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runtime-environment description extracted from a session's init request.
#[derive(Clone, Debug, Default)]
pub struct JobConfig {
    pub serialized_runtime_env: String,
    pub runtime_env_config: String,
}

impl JobConfig {
    /// True when the description denotes the default (empty) environment, in
    /// which case the runtime-env agent is not consulted.
    pub fn is_empty_env(&self) -> bool {
        self.serialized_runtime_env.is_empty() || self.serialized_runtime_env == "{}"
    }
}

/// Produces the cluster address when none was configured up front. Invoked at
/// most once, on first access; the result is cached.
#[async_trait::async_trait]
pub trait ClusterBootstrap: Send + Sync {
    async fn bootstrap(&self) -> Result<String, String>;
}

#[derive(Debug)]
pub enum RegisterError {
    /// The client already has a registered backend.
    Duplicate(String),
    /// No port (or channel) could be allocated for a new backend.
    Resources(String),
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterError::Duplicate(client_id) => {
                write!(f, "a backend is already registered for client {client_id}")
            }
            RegisterError::Resources(msg) => write!(f, "{msg}"),
        }
    }
}

struct SessionState {
    backends: HashMap<String, Arc<BackendHandle>>,
    free_ports: PortPool,
    /// Start time of the most recent data stream per client.
    last_seen: HashMap<String, Instant>,
    /// Reconnect grace period declared by each client's init request.
    grace_periods: HashMap<String, u32>,
    /// Aggregate count reported to drivers in connection-info responses.
    num_clients: usize,
}

/// Owns every per-client backend server: creation, startup, lookup, reaping
/// and shutdown, plus the stream bookkeeping shared with the data servicer.
///
/// All shared state lives behind one mutex, and the mutex is never held
/// across an await: the long suspensions (runtime-env provisioning, exec
/// transition, channel readiness, grace sleeps) all happen lock-free against
/// a cloned [`BackendHandle`].
pub struct SessionManager {
    state: Mutex<SessionState>,
    launch: BackendLaunchConfig,
    timeouts: SessionTimeouts,
    provisioner: Option<RuntimeEnvProvisioner>,
    configured_address: Option<String>,
    bootstrap: Option<Arc<dyn ClusterBootstrap>>,
    cluster_address: OnceCell<String>,
    stopped: watch::Sender<bool>,
}

impl SessionManager {
    pub fn new(
        cluster_address: Option<String>,
        bootstrap: Option<Arc<dyn ClusterBootstrap>>,
        launch: BackendLaunchConfig,
        port_range: PortRangeConfig,
        timeouts: SessionTimeouts,
        provisioner: Option<RuntimeEnvProvisioner>,
    ) -> Result<Arc<SessionManager>, String> {
        if port_range.min >= port_range.max {
            return Err(format!(
                "invalid backend port range [{}, {})",
                port_range.min, port_range.max
            ));
        }
        if launch.program.is_empty() {
            return Err("backend launch config must name a program".to_owned());
        }

        let (stopped, _) = watch::channel(false);
        let reap_interval = timeouts.reap_interval;
        let manager = Arc::new(SessionManager {
            state: Mutex::new(SessionState {
                backends: HashMap::new(),
                free_ports: PortPool::new(port_range.min..port_range.max),
                last_seen: HashMap::new(),
                grace_periods: HashMap::new(),
                num_clients: 0,
            }),
            launch,
            timeouts,
            provisioner,
            configured_address: cluster_address,
            bootstrap,
            cluster_address: OnceCell::new(),
            stopped,
        });
        tokio::spawn(Self::reap_task(Arc::downgrade(&manager), reap_interval));
        Ok(manager)
    }

    /// Periodically sweep for backend processes that exited on their own and
    /// return their ports to the pool.
    async fn reap_task(manager: Weak<SessionManager>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let Some(manager) = manager.upgrade() else {
                // The manager is shutting down.
                return;
            };
            manager.reap_exited();
        }
    }

    fn reap_exited(&self) {
        let mut state = self.state.lock();
        let client_ids: Vec<String> = state.backends.keys().cloned().collect();
        for client_id in client_ids {
            let Some(backend) = state.backends.get(&client_id).cloned() else {
                continue;
            };
            if let Some(status) = backend.poll_exit() {
                let port = backend.port();
                log::info!(
                    "backend server for client {client_id} is no longer running ({status}); \
                     freeing its port {port}"
                );
                state.backends.remove(&client_id);
                state.free_ports.release(port);
            }
        }
    }

    /// Create, but do not start, a backend for `client_id`. Must be called
    /// once per client.
    pub fn register(&self, client_id: &str) -> Result<Arc<BackendHandle>, RegisterError> {
        let mut state = self.state.lock();
        if state.backends.contains_key(client_id) {
            return Err(RegisterError::Duplicate(client_id.to_owned()));
        }
        let port = state
            .free_ports
            .acquire()
            .map_err(RegisterError::Resources)?;
        let channel = match loopback_channel(port) {
            Ok(channel) => channel,
            Err(err) => {
                state.free_ports.release(port);
                return Err(RegisterError::Resources(err));
            }
        };
        let backend = Arc::new(BackendHandle::new(port, channel));
        state.backends.insert(client_id.to_owned(), backend.clone());
        Ok(backend)
    }

    /// The configured cluster address, or the result of triggering bootstrap
    /// on first access (cached).
    pub async fn cluster_address(&self) -> Result<String, String> {
        if let Some(address) = &self.configured_address {
            return Ok(address.clone());
        }
        let bootstrap = self.bootstrap.as_ref().ok_or_else(|| {
            "no cluster address is configured and no bootstrapper is available".to_owned()
        })?;
        self.cluster_address
            .get_or_try_init(|| bootstrap.bootstrap())
            .await
            .cloned()
    }

    /// Start the backend server for a registered client. Returns whether the
    /// process was still running once startup completed.
    pub async fn start(&self, client_id: &str, job_config: &JobConfig) -> Result<bool, String> {
        let backend = self
            .lookup(client_id)
            .ok_or_else(|| format!("no backend has been registered for client {client_id}"))?;

        match self.spawn_backend(client_id, &backend, job_config).await {
            Ok(process) => {
                let running = process.poll_exit().is_none();
                backend.set_result(Some(process));
                Ok(running)
            }
            Err(err) => {
                // Resolve the one-shot slot so readiness waiters fail fast
                // instead of hanging until stream finalization.
                backend.set_result(None);
                Err(err)
            }
        }
    }

    async fn spawn_backend(
        &self,
        client_id: &str,
        backend: &BackendHandle,
        job_config: &JobConfig,
    ) -> Result<Arc<BackendProcess>, String> {
        let port = backend.port();

        let runtime_env_context = if job_config.is_empty_env() {
            String::new()
        } else {
            let provisioner = self.provisioner.as_ref().ok_or_else(|| {
                "a runtime environment was requested but no runtime-env agent address is \
                 configured"
                    .to_owned()
            })?;
            provisioner
                .get_or_create(
                    &job_config.serialized_runtime_env,
                    &job_config.runtime_env_config,
                    port,
                )
                .await?
        };

        let cluster_address = self.cluster_address().await?;
        let (stdout, stderr) = self.backend_log_files(port)?;

        let mut command = Command::new(&self.launch.program);
        command
            .args(backend_args(
                &self.launch.args,
                &cluster_address,
                port,
                &runtime_env_context,
            ))
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);

        let child = command.spawn().map_err(|err| {
            format!(
                "failed to spawn backend server {}: {err}",
                self.launch.program
            )
        })?;
        let pid = child.id().unwrap_or_default();
        let process = Arc::new(BackendProcess::new(pid, child));

        self.await_exec_transition(client_id, &process).await;

        log::info!("backend server started on port {port} with PID {pid} for client {client_id}");
        Ok(process)
    }

    /// Wait for the spawned child to exec from its launcher shim into the
    /// backend server binary, or exit, whichever comes first. Platforms
    /// without cheap process introspection trust the spawn.
    async fn await_exec_transition(&self, client_id: &str, process: &BackendProcess) {
        #[cfg(target_os = "linux")]
        loop {
            if process.poll_exit().is_some() {
                log::error!("backend server startup failed for client {client_id}");
                break;
            }
            match tokio::fs::read(format!("/proc/{}/cmdline", process.pid())).await {
                Ok(raw) => {
                    let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
                    if cmdline.contains(&self.launch.ready_match) {
                        break;
                    }
                }
                Err(err) => {
                    log::debug!("unable to inspect child {}: {err}", process.pid());
                }
            }
            log::debug!("waiting for the child to exec into the backend server");
            tokio::time::sleep(EXEC_TRANSITION_POLL_INTERVAL).await;
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (client_id, process);
        }
    }

    /// Stdio destinations for a backend, named by its port.
    fn backend_log_files(&self, port: u16) -> Result<(std::fs::File, std::fs::File), String> {
        std::fs::create_dir_all(&self.launch.log_dir)
            .map_err(|err| format!("failed to create backend log dir: {err}"))?;
        let open = |suffix: &str| {
            let path = self
                .launch
                .log_dir
                .join(format!("backend_server_{port}.{suffix}"));
            std::fs::File::create(&path)
                .map_err(|err| format!("failed to open {}: {err}", path.display()))
        };
        Ok((open("out")?, open("err")?))
    }

    pub fn lookup(&self, client_id: &str) -> Option<Arc<BackendHandle>> {
        self.state.lock().backends.get(client_id).cloned()
    }

    /// True when the client has a backend whose spawn outcome is known.
    pub fn has_channel(&self, client_id: &str) -> bool {
        self.lookup(client_id)
            .map(|backend| backend.is_ready())
            .unwrap_or(false)
    }

    /// Find the channel for `client_id`, blocking until the backend process
    /// has started and the channel's transport is ready.
    ///
    /// Every failure mode (unknown client, startup failure, readiness
    /// timeout) surfaces as `None`; callers translate that to NOT_FOUND.
    pub async fn channel_for(&self, client_id: &str) -> Option<Channel> {
        let Some(backend) = self.lookup(client_id) else {
            log::error!("unable to find a channel for client {client_id}");
            return None;
        };
        if let Err(err) = backend.wait_ready().await {
            log::error!("backend for client {client_id} did not start: {err}");
            return None;
        }
        let channel = backend.channel();
        match wait_until_ready(&channel, self.timeouts.channel_ready).await {
            Ok(()) => Some(channel),
            Err(err) => {
                log::error!("timed out waiting for the channel for client {client_id}: {err}");
                None
            }
        }
    }

    /// Record the start of a brand-new data stream.
    pub(crate) fn client_connected(&self, client_id: &str, start_time: Instant) {
        let mut state = self.state.lock();
        state.last_seen.insert(client_id.to_owned(), start_time);
        state.num_clients += 1;
    }

    /// Record the start of a reconnecting data stream. Returns false when the
    /// session has already been cleaned up.
    pub(crate) fn touch_reconnect(&self, client_id: &str, start_time: Instant) -> bool {
        let mut state = self.state.lock();
        match state.last_seen.get_mut(client_id) {
            Some(last_seen) => {
                *last_seen = start_time;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_grace_period(&self, client_id: &str, seconds: u32) {
        self.state
            .lock()
            .grace_periods
            .insert(client_id.to_owned(), seconds);
    }

    pub(crate) fn grace_period(&self, client_id: &str) -> Option<u32> {
        self.state.lock().grace_periods.get(client_id).copied()
    }

    /// Final cleanup for a data stream that started at `start_time`.
    ///
    /// A no-op when another path already cleaned the session up, or when a
    /// newer stream for the same client is active (the client reconnected).
    /// Otherwise the session is fully reclaimed: the bookkeeping drops the
    /// client, readiness waiters are unblocked with the failure sentinel, the
    /// process is killed and the port returns to the pool.
    pub(crate) fn finish_stream(&self, client_id: &str, start_time: Instant) {
        let mut state = self.state.lock();
        let Some(last_seen) = state.last_seen.get(client_id).copied() else {
            log::info!("client {client_id} not found; skipping cleanup");
            return;
        };
        if last_seen > start_time {
            log::info!("client {client_id} reconnected; skipping cleanup");
            return;
        }
        log::debug!("client detached: {client_id}");
        state.num_clients -= 1;
        state.last_seen.remove(client_id);
        state.grace_periods.remove(client_id);
        if let Some(backend) = state.backends.remove(client_id) {
            backend.set_result(None);
            backend.kill();
            state.free_ports.release(backend.port());
        }
    }

    /// Wait up to `limit` for proxier shutdown to be signaled.
    pub(crate) async fn wait_stopped(&self, limit: Duration) {
        let mut stopped = self.stopped.subscribe();
        let _ = tokio::time::timeout(limit, async move {
            loop {
                if *stopped.borrow_and_update() {
                    return;
                }
                if stopped.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
    }

    /// Wake every grace-period sleep so sessions clean up promptly.
    pub fn signal_stopped(&self) {
        self.stopped.send_replace(true);
    }

    /// Forcibly kill all spawned backend servers. This is the safety net for
    /// platforms where kill-on-drop fate sharing does not hold.
    pub fn shutdown_all(&self) {
        let state = self.state.lock();
        for backend in state.backends.values() {
            backend.kill();
        }
    }

    pub(crate) fn logstream_retry_policy(&self) -> (usize, Duration) {
        (
            self.timeouts.logstream_retries,
            self.timeouts.logstream_retry_interval,
        )
    }

    pub fn num_clients(&self) -> usize {
        self.state.lock().num_clients
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.state.lock().backends.contains_key(client_id)
    }

    pub fn free_port_count(&self) -> usize {
        self.state.lock().free_ports.free_len()
    }
}

/// Assemble the backend command line: operator-supplied arguments first, then
/// the cluster address, the listen port and (when present) the provisioned
/// runtime-env context.
fn backend_args(
    extra: &[String],
    cluster_address: &str,
    port: u16,
    runtime_env_context: &str,
) -> Vec<String> {
    let mut args = extra.to_vec();
    args.push("--address".to_owned());
    args.push(cluster_address.to_owned());
    args.push("--port".to_owned());
    args.push(port.to_string());
    if !runtime_env_context.is_empty() {
        args.push("--runtime-env-context".to_owned());
        args.push(runtime_env_context.to_owned());
    }
    args
}
