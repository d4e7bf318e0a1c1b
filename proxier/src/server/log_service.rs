// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use protos::sessionapi::log_streamer_client::LogStreamerClient;
use protos::sessionapi::log_streamer_server::LogStreamer;
use protos::sessionapi::{LogData, LogSettingsRequest};
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status, Streaming};

use crate::server::manager::SessionManager;
use crate::server::{client_id_from_metadata, relayed_requests, CLIENT_ID_METADATA_KEY};

/// Terminates the log service and forwards the stream to the caller's
/// backend server.
pub(crate) struct LogService {
    manager: Arc<SessionManager>,
}

impl LogService {
    #[allow(dead_code)]
    pub const SERVICE_NAME: &'static str = "sessionapi.LogStreamer";

    pub(crate) fn new(manager: Arc<SessionManager>) -> Self {
        LogService { manager }
    }
}

#[tonic::async_trait]
impl LogStreamer for LogService {
    type LogstreamStream = Pin<Box<dyn Stream<Item = Result<LogData, Status>> + Send>>;

    #[tracing::instrument(skip_all)]
    async fn logstream(
        &self,
        request: Request<Streaming<LogSettingsRequest>>,
    ) -> Result<Response<Self::LogstreamStream>, Status> {
        let metadata = request.metadata().clone();
        let Some(client_id) = client_id_from_metadata(&metadata) else {
            return Ok(Response::new(Box::pin(futures::stream::empty())));
        };
        log::debug!("new log stream connection from client {client_id}");
        let inbound = request.into_inner();

        // The log client may connect before the data client has caused the
        // backend to spawn; retry for a while before giving up.
        let (retries, retry_interval) = self.manager.logstream_retry_policy();
        let mut channel = None;
        for attempt in 0..retries {
            channel = self.manager.channel_for(&client_id).await;
            if channel.is_some() {
                break;
            }
            log::warn!(
                "retrying the log stream connection for client {client_id}; {} attempts failed",
                attempt + 1
            );
            tokio::time::sleep(retry_interval).await;
        }
        let Some(channel) = channel else {
            return Err(Status::not_found(format!(
                "log stream proxy failed to connect; no channel for client {client_id}"
            )));
        };

        let mut request = Request::new(relayed_requests(inbound, None));
        request.metadata_mut().insert(
            CLIENT_ID_METADATA_KEY,
            MetadataValue::try_from(client_id.as_str())
                .map_err(|_| Status::invalid_argument("client id is not a valid metadata value"))?,
        );

        let mut client = LogStreamerClient::new(channel);
        let mut responses = client.logstream(request).await?.into_inner();

        let outbound = async_stream::stream! {
            while let Some(item) = responses.next().await {
                match item {
                    Ok(log_data) => yield Ok(log_data),
                    Err(status) => {
                        // Backend-side failures end the log stream; they are
                        // not the driver's problem.
                        log::error!("proxying the log stream failed: {status}");
                        break;
                    }
                }
            }
        };
        Ok(Response::new(Box::pin(outbound)))
    }
}
