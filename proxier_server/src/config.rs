// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use grpc_util::infra::{GrpcConfig, InfraConfig};
use proxier::{BackendLaunchConfig, PortRangeConfig, SessionTimeouts};
use serde::Deserialize;

/// Session timing knobs, in config-friendly units.
#[derive(Deserialize, Debug, Default)]
pub struct SessionTimeoutsConfig {
    /// Seconds to wait for a backend channel to become ready.
    pub channel_ready_s: Option<u64>,

    /// Seconds between reaper sweeps for exited backends.
    pub reap_interval_s: Option<u64>,

    /// Channel retries granted to log streams racing session startup.
    pub logstream_retries: Option<usize>,

    /// Seconds between those retries.
    pub logstream_retry_interval_s: Option<u64>,
}

impl SessionTimeoutsConfig {
    pub fn into_session_timeouts(self) -> SessionTimeouts {
        let defaults = SessionTimeouts::default();
        SessionTimeouts {
            channel_ready: self
                .channel_ready_s
                .map(Duration::from_secs)
                .unwrap_or(defaults.channel_ready),
            reap_interval: self
                .reap_interval_s
                .map(Duration::from_secs)
                .unwrap_or(defaults.reap_interval),
            logstream_retries: self.logstream_retries.unwrap_or(defaults.logstream_retries),
            logstream_retry_interval: self
                .logstream_retry_interval_s
                .map(Duration::from_secs)
                .unwrap_or(defaults.logstream_retry_interval),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// Address the proxier listens on for driver connections.
    pub listen_address: String,

    /// Bootstrap address of the compute cluster that backends attach to.
    /// When unset, sessions fail at startup time.
    pub cluster_address: Option<String>,

    /// Base URL of the runtime-env agent. Required once a session declares a
    /// non-empty runtime environment.
    pub runtime_env_agent_address: Option<String>,

    /// TCP port range from which backend ports are drawn.
    #[serde(default)]
    pub port_range: PortRangeConfig,

    /// How to launch the per-client backend server.
    pub backend: BackendLaunchConfig,

    /// Timeouts and retry cadences.
    pub timeouts: Option<SessionTimeoutsConfig>,

    /// Admin endpoints configuration.
    pub infra: Option<InfraConfig>,

    /// gRPC configuration.
    pub grpc: Option<GrpcConfig>,
}

impl Config {
    pub fn from_str(raw_config: &str) -> Result<Config, String> {
        serde_yaml::from_str(raw_config).map_err(|e| format!("config parse error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Config;

    #[test]
    fn parses_a_minimal_config() {
        let config = Config::from_str(
            r#"
listen_address: "0.0.0.0:10001"
cluster_address: "10.0.0.1:6379"
runtime_env_agent_address: "http://127.0.0.1:52365"
backend:
  program: "/usr/local/bin/session-backend"
  args: ["--num-workers", "4"]
  log_dir: "/var/log/proxier"
timeouts:
  channel_ready_s: 10
"#,
        )
        .unwrap();

        assert_eq!(config.listen_address, "0.0.0.0:10001");
        assert_eq!(config.port_range.min, 23000);
        assert_eq!(config.port_range.max, 24000);
        assert_eq!(config.backend.ready_match, "session-backend");

        let timeouts = config.timeouts.unwrap().into_session_timeouts();
        assert_eq!(timeouts.channel_ready, Duration::from_secs(10));
        assert_eq!(timeouts.reap_interval, Duration::from_secs(30));
        assert_eq!(timeouts.logstream_retries, 5);
    }

    #[test]
    fn rejects_a_config_without_a_backend() {
        assert!(Config::from_str("listen_address: \"0.0.0.0:10001\"").is_err());
    }
}
