// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use protos::sessionapi::data_streamer_client::DataStreamerClient;
use protos::sessionapi::data_streamer_server::DataStreamer;
use protos::sessionapi::{data_request, data_response, DataRequest, DataResponse, InitResponse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status, Streaming};

use crate::server::manager::{JobConfig, RegisterError, SessionManager};
use crate::server::{
    client_id_from_metadata, reconnecting_from_metadata, relayed_requests,
    CLIENT_ID_METADATA_KEY, RECONNECTING_METADATA_KEY,
};

/// Backpressure window between the forwarding task and the caller's response
/// stream.
const RESPONSE_BUFFER: usize = 16;

/// Terminates the session data plane. Each `Datapath` stream creates (or
/// reattaches to) the caller's backend server and relays the stream to it.
#[derive(Clone)]
pub(crate) struct DataService {
    manager: Arc<SessionManager>,
}

enum StreamSetup {
    /// Relay the (possibly re-headed) request stream to the backend.
    Forward {
        channel: Channel,
        first: Option<DataRequest>,
    },
    /// Session startup failed; report it in-band as a failed init response.
    InitFailure { req_id: i32, msg: String },
    /// A reconnect could not be honored; fail the stream with a status.
    Abort(Status),
}

impl DataService {
    #[allow(dead_code)]
    pub const SERVICE_NAME: &'static str = "sessionapi.DataStreamer";

    pub(crate) fn new(manager: Arc<SessionManager>) -> Self {
        DataService { manager }
    }

    /// Read the init request, record its grace period, and start the backend
    /// server. On failure, returns the init request's id (when known) and a
    /// diagnostic for the driver.
    async fn start_session(
        &self,
        client_id: &str,
        port: u16,
        inbound: &mut Streaming<DataRequest>,
    ) -> Result<DataRequest, (i32, String)> {
        let first = match inbound.next().await {
            Some(Ok(first)) => first,
            Some(Err(status)) => return Err((0, format!("failed to read the init request: {status}"))),
            None => return Err((0, "the data stream ended before an init request".to_owned())),
        };
        let req_id = first.req_id;

        if let Some(data_request::Type::Init(init)) = &first.r#type {
            self.manager
                .set_grace_period(client_id, init.reconnect_grace_period);
        }

        let (init_request, job_config) =
            prepare_init_request(first).map_err(|msg| (req_id, msg))?;

        match self.manager.start(client_id, &job_config).await {
            Ok(true) => Ok(init_request),
            Ok(false) => Err((
                req_id,
                format!(
                    "starting the backend server failed; see backend_server_{port}.err for \
                     detailed logs"
                ),
            )),
            Err(err) => Err((req_id, err)),
        }
    }
}

/// Identity hook for preparing the opaque job config before it reaches the
/// backend server. The payload must not be interpreted here; a deployment
/// with an environment policy can swap in a real implementation.
fn prep_job_config(job_config: Bytes) -> Bytes {
    job_config
}

/// Check that `request` is an init request, run its job config through the
/// prep hook, and rebuild the message with every other init field preserved.
fn prepare_init_request(request: DataRequest) -> Result<(DataRequest, JobConfig), String> {
    let req_id = request.req_id;
    let Some(data_request::Type::Init(init)) = request.r#type else {
        return Err("the first message on a data stream must be an init request".to_owned());
    };
    let job_config = JobConfig {
        serialized_runtime_env: init.serialized_runtime_env.clone(),
        runtime_env_config: init.runtime_env_config.clone(),
    };
    let prepared = protos::sessionapi::InitRequest {
        job_config: prep_job_config(init.job_config.clone()),
        ..init
    };
    Ok((
        DataRequest {
            req_id,
            r#type: Some(data_request::Type::Init(prepared)),
        },
        job_config,
    ))
}

/// Forward failures with these codes leave the session recoverable; anything
/// else tears it down without waiting out the grace period.
fn is_recoverable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted
    )
}

#[tonic::async_trait]
impl DataStreamer for DataService {
    type DatapathStream = ReceiverStream<Result<DataResponse, Status>>;

    #[tracing::instrument(skip_all)]
    async fn datapath(
        &self,
        request: Request<Streaming<DataRequest>>,
    ) -> Result<Response<Self::DatapathStream>, Status> {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let metadata = request.metadata().clone();

        let Some(client_id) = client_id_from_metadata(&metadata) else {
            // No id, no session: close the stream without a response.
            return Ok(Response::new(ReceiverStream::new(rx)));
        };
        let reconnecting = reconnecting_from_metadata(&metadata);
        let start_time = Instant::now();
        let mut inbound = request.into_inner();

        let setup = if reconnecting {
            if !self.manager.touch_reconnect(&client_id, start_time) {
                // The client took too long to come back.
                return Err(Status::not_found(
                    "attempted to reconnect a session that has already been cleaned up",
                ));
            }
            match self.manager.channel_for(&client_id).await {
                Some(channel) => StreamSetup::Forward {
                    channel,
                    first: None,
                },
                None => StreamSetup::Abort(Status::not_found(format!(
                    "no backend channel for reconnecting client {client_id}"
                ))),
            }
        } else {
            log::info!("new data connection from client {client_id}");
            // Register the backend, reserving its port and channel, before
            // reading the init request.
            match self.manager.register(&client_id) {
                Ok(backend) => {
                    self.manager.client_connected(&client_id, start_time);
                    let port = backend.port();
                    match self.start_session(&client_id, port, &mut inbound).await {
                        Ok(init_request) => match self.manager.channel_for(&client_id).await {
                            Some(channel) => StreamSetup::Forward {
                                channel,
                                first: Some(init_request),
                            },
                            None => StreamSetup::InitFailure {
                                req_id: init_request.req_id,
                                msg: format!(
                                    "the proxier failed to connect to the backend server; check \
                                     backend_server_{port}.err on the host for the relevant logs"
                                ),
                            },
                        },
                        Err((req_id, msg)) => StreamSetup::InitFailure { req_id, msg },
                    }
                }
                // A live session already exists for this id. Failing fast
                // here must not run the finalization below, which would tear
                // that session down.
                Err(err @ RegisterError::Duplicate(_)) => {
                    return Err(Status::already_exists(err.to_string()));
                }
                // Port exhaustion: nothing was registered, so the
                // finalization below has nothing to reclaim.
                Err(err @ RegisterError::Resources(_)) => StreamSetup::InitFailure {
                    req_id: 0,
                    msg: err.to_string(),
                },
            }
        };

        tokio::spawn(run_datapath(
            self.manager.clone(),
            client_id,
            reconnecting,
            start_time,
            setup,
            inbound,
            tx,
        ));

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Drives one data stream end to end and then runs its finalization. Owning
/// this in a spawned task, rather than in the response stream itself,
/// guarantees the finalization runs even when the caller disappears
/// mid-stream.
async fn run_datapath(
    manager: Arc<SessionManager>,
    client_id: String,
    reconnecting: bool,
    start_time: Instant,
    setup: StreamSetup,
    inbound: Streaming<DataRequest>,
    tx: mpsc::Sender<Result<DataResponse, Status>>,
) {
    let mut cleanup_requested = false;

    match setup {
        StreamSetup::InitFailure { req_id, msg } => {
            log::error!("session startup failed for client {client_id}: {msg}");
            let response = DataResponse {
                req_id,
                r#type: Some(data_response::Type::Init(InitResponse { ok: false, msg })),
            };
            let _ = tx.send(Ok(response)).await;
        }
        StreamSetup::Abort(status) => {
            log::error!("data stream for client {client_id} aborted: {status}");
            cleanup_requested = true;
            let _ = tx.send(Err(status)).await;
        }
        StreamSetup::Forward { channel, first } => {
            let result = forward_datapath(
                &manager,
                &client_id,
                reconnecting,
                channel,
                first,
                inbound,
                &tx,
                &mut cleanup_requested,
            )
            .await;
            if let Err(status) = result {
                log::error!("proxying the data stream for client {client_id} failed: {status}");
                if !is_recoverable(&status) {
                    // The client should not attempt to recover; tear the
                    // session down without waiting for a reconnect.
                    cleanup_requested = true;
                }
                let _ = tx.send(Err(status)).await;
            }
        }
    }

    // Close the caller's stream before lingering for a reconnect.
    drop(tx);

    if !cleanup_requested {
        if let Some(seconds) = manager.grace_period(&client_id) {
            if seconds > 0 {
                manager
                    .wait_stopped(Duration::from_secs(u64::from(seconds)))
                    .await;
            }
        }
    }
    manager.finish_stream(&client_id, start_time);
}

#[allow(clippy::too_many_arguments)]
async fn forward_datapath(
    manager: &SessionManager,
    client_id: &str,
    reconnecting: bool,
    channel: Channel,
    first: Option<DataRequest>,
    inbound: Streaming<DataRequest>,
    tx: &mpsc::Sender<Result<DataResponse, Status>>,
    cleanup_requested: &mut bool,
) -> Result<(), Status> {
    let mut request = Request::new(relayed_requests(inbound, first));
    let metadata = request.metadata_mut();
    metadata.insert(
        CLIENT_ID_METADATA_KEY,
        MetadataValue::try_from(client_id)
            .map_err(|_| Status::invalid_argument("client id is not a valid metadata value"))?,
    );
    metadata.insert(
        RECONNECTING_METADATA_KEY,
        MetadataValue::from_static(if reconnecting { "true" } else { "false" }),
    );

    let mut client = DataStreamerClient::new(channel);
    let mut responses = client.datapath(request).await?.into_inner();

    while let Some(item) = responses.next().await {
        let mut response = item?;
        match response.r#type.as_mut() {
            Some(data_response::Type::ConnectionCleanup(_)) => {
                // The backend is skipping its reconnect window, so the
                // proxier must too.
                *cleanup_requested = true;
            }
            Some(data_response::Type::ConnectionInfo(info)) => {
                // A dedicated backend only ever sees one client; report the
                // proxier-wide count instead.
                info.num_clients = manager.num_clients() as i32;
            }
            _ => {}
        }
        if tx.send(Ok(response)).await.is_err() {
            // The caller went away; stop pulling from the backend.
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use protos::sessionapi::{data_request, DataRequest, InitRequest};
    use tonic::{Code, Status};

    use super::{is_recoverable, prepare_init_request};

    #[test]
    fn init_preparation_round_trips() {
        let init = InitRequest {
            job_config: Bytes::from_static(b"\x80\x04N."),
            init_kwargs_json: "{\"namespace\": \"test\"}".to_owned(),
            reconnect_grace_period: 30,
            serialized_runtime_env: "{}".to_owned(),
            runtime_env_config: String::new(),
        };
        let request = DataRequest {
            req_id: 3,
            r#type: Some(data_request::Type::Init(init.clone())),
        };

        let (prepared, job_config) = prepare_init_request(request).unwrap();
        // The prep hook is the identity: every field survives unchanged.
        assert_eq!(prepared.req_id, 3);
        assert_eq!(prepared.r#type, Some(data_request::Type::Init(init)));
        assert!(job_config.is_empty_env());
    }

    #[test]
    fn non_init_first_message_is_rejected() {
        let request = DataRequest {
            req_id: 1,
            r#type: Some(data_request::Type::ConnectionInfo(Default::default())),
        };
        assert!(prepare_init_request(request).is_err());
    }

    #[test]
    fn job_config_extraction_reads_the_runtime_env() {
        let request = DataRequest {
            req_id: 1,
            r#type: Some(data_request::Type::Init(InitRequest {
                serialized_runtime_env: "{\"pip\": [\"requests\"]}".to_owned(),
                ..Default::default()
            })),
        };
        let (_, job_config) = prepare_init_request(request).unwrap();
        assert!(!job_config.is_empty_env());
        assert_eq!(job_config.serialized_runtime_env, "{\"pip\": [\"requests\"]}");
    }

    #[test]
    fn recoverability_is_code_based() {
        assert!(is_recoverable(&Status::new(Code::Unavailable, "x")));
        assert!(is_recoverable(&Status::new(Code::DeadlineExceeded, "x")));
        assert!(!is_recoverable(&Status::new(Code::Internal, "x")));
        assert!(!is_recoverable(&Status::new(Code::InvalidArgument, "x")));
    }
}
