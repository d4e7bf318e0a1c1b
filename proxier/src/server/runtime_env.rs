// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request};
use prost::Message;
use protos::runtimeenv::{
    AgentRpcStatus, GetOrCreateRuntimeEnvReply, GetOrCreateRuntimeEnvRequest,
};

/// Additional attempts after the first failed POST.
const MAX_RETRIES: u32 = 5;

/// First backoff, doubled after every failed attempt (0.5, 1, 2, 4, 8s).
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Client for the runtime-env agent, an HTTP service that materializes the
/// runtime environment described by a session's init request.
///
/// NB: each attempt is issued without an overall timeout. The agent is local
/// to the node, and how long provisioning itself takes is unbounded.
pub struct RuntimeEnvProvisioner {
    url: String,
    client: Client<HttpConnector>,
}

impl RuntimeEnvProvisioner {
    pub fn new(agent_address: &str) -> RuntimeEnvProvisioner {
        RuntimeEnvProvisioner {
            url: format!(
                "{}/get_or_create_runtime_env",
                agent_address.trim_end_matches('/')
            ),
            client: Client::new(),
        }
    }

    /// Ask the agent to materialize `serialized_runtime_env`, returning the
    /// serialized context handed to the spawned backend server.
    ///
    /// Transport failures (including non-2xx responses) are retried with
    /// exponential backoff, since the agent may simply not have started yet.
    /// An explicit FAILED reply is terminal.
    pub async fn get_or_create(
        &self,
        serialized_runtime_env: &str,
        runtime_env_config: &str,
        backend_port: u16,
    ) -> Result<String, String> {
        log::info!(
            "requesting runtime env for the backend on port {backend_port}; \
             serialized env is {serialized_runtime_env}"
        );

        let request = GetOrCreateRuntimeEnvRequest {
            serialized_runtime_env: serialized_runtime_env.to_owned(),
            runtime_env_config: runtime_env_config.to_owned(),
            job_id: format!("ray_client_server_{backend_port}").into_bytes().into(),
            source_process: "proxier".to_owned(),
        };
        let body = request.encode_to_vec();

        let mut wait = INITIAL_BACKOFF;
        let mut last_error = String::new();
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                log::warn!(
                    "get_or_create_runtime_env request failed: {last_error}. \
                     Retrying after {wait:?} ({attempt}/{MAX_RETRIES})."
                );
                tokio::time::sleep(wait).await;
                wait *= 2;
            }
            match self.post(body.clone()).await {
                Ok(raw) => {
                    let reply = GetOrCreateRuntimeEnvReply::decode(raw.as_ref())
                        .map_err(|err| format!("malformed reply from runtime-env agent: {err}"))?;
                    return match AgentRpcStatus::from_i32(reply.status) {
                        Some(AgentRpcStatus::Ok) => Ok(reply.serialized_runtime_env_context),
                        Some(AgentRpcStatus::Failed) => Err(format!(
                            "failed to create a runtime env for the backend server: {}",
                            reply.error_message
                        )),
                        _ => Err(format!(
                            "unknown runtime-env agent status: {}",
                            reply.status
                        )),
                    };
                }
                Err(err) => last_error = err,
            }
        }

        Err(format!(
            "get_or_create_runtime_env request failed after {MAX_RETRIES} retries; \
             last error: {last_error}"
        ))
    }

    async fn post(&self, body: Vec<u8>) -> Result<bytes::Bytes, String> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(body))
            .map_err(|err| format!("failed to build the agent request: {err}"))?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| format!("agent request failed: {err}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("agent returned HTTP {status}"));
        }
        hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| format!("failed to read the agent response: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Response, Server, StatusCode};
    use prost::Message;
    use protos::runtimeenv::{
        AgentRpcStatus, GetOrCreateRuntimeEnvReply, GetOrCreateRuntimeEnvRequest,
    };

    use super::RuntimeEnvProvisioner;

    /// Serve `/get_or_create_runtime_env`, failing with HTTP 500 for the
    /// first `failures` requests and then answering with `reply`.
    fn spawn_agent(
        failures: usize,
        reply: GetOrCreateRuntimeEnvReply,
    ) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let svc_hits = hits.clone();
        let make_svc = make_service_fn(move |_conn| {
            let hits = svc_hits.clone();
            let reply = reply.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request: hyper::Request<Body>| {
                    let hits = hits.clone();
                    let reply = reply.clone();
                    async move {
                        assert_eq!(request.uri().path(), "/get_or_create_runtime_env");
                        let body = hyper::body::to_bytes(request.into_body()).await.unwrap();
                        let decoded =
                            GetOrCreateRuntimeEnvRequest::decode(body.as_ref()).unwrap();
                        assert!(decoded.job_id.starts_with(b"ray_client_server_"));

                        let hit = hits.fetch_add(1, Ordering::SeqCst);
                        let response = if hit < failures {
                            Response::builder()
                                .status(StatusCode::INTERNAL_SERVER_ERROR)
                                .body(Body::empty())
                                .unwrap()
                        } else {
                            Response::new(Body::from(reply.encode_to_vec()))
                        };
                        Ok::<_, Infallible>(response)
                    }
                }))
            }
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let address = server.local_addr();
        tokio::spawn(server);
        (format!("http://{address}"), hits)
    }

    fn ok_reply(context: &str) -> GetOrCreateRuntimeEnvReply {
        GetOrCreateRuntimeEnvReply {
            status: AgentRpcStatus::Ok as i32,
            error_message: String::new(),
            serialized_runtime_env_context: context.to_owned(),
        }
    }

    #[tokio::test]
    async fn transport_failures_are_retried_with_backoff() {
        let (url, hits) = spawn_agent(2, ok_reply("ctx-xyz"));
        let provisioner = RuntimeEnvProvisioner::new(&url);

        let started = Instant::now();
        let context = provisioner
            .get_or_create("{\"pip\": [\"requests\"]}", "", 23001)
            .await
            .unwrap();

        assert_eq!(context, "ctx-xyz");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        // The first two failures slept 0.5s and 1s respectively.
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn failed_status_is_terminal() {
        let reply = GetOrCreateRuntimeEnvReply {
            status: AgentRpcStatus::Failed as i32,
            error_message: "bad env".to_owned(),
            serialized_runtime_env_context: String::new(),
        };
        let (url, hits) = spawn_agent(0, reply);
        let provisioner = RuntimeEnvProvisioner::new(&url);

        let err = provisioner
            .get_or_create("{\"pip\": [\"x\"]}", "", 23002)
            .await
            .unwrap_err();
        assert!(err.contains("bad env"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_status_is_fatal() {
        let reply = GetOrCreateRuntimeEnvReply {
            status: 42,
            error_message: String::new(),
            serialized_runtime_env_context: String::new(),
        };
        let (url, hits) = spawn_agent(0, reply);
        let provisioner = RuntimeEnvProvisioner::new(&url);

        let err = provisioner
            .get_or_create("{\"pip\": [\"x\"]}", "", 23003)
            .await
            .unwrap_err();
        assert!(err.contains("unknown runtime-env agent status"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_the_last_error() {
        // Nothing listens here; every attempt is refused. Paused time fasts
        // through the 15.5s of backoff.
        let provisioner = RuntimeEnvProvisioner::new("http://127.0.0.1:9");
        let err = provisioner
            .get_or_create("{\"pip\": [\"x\"]}", "", 23004)
            .await
            .unwrap_err();
        assert!(err.contains("after 5 retries"));
    }
}
