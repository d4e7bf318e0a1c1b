// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Minimal stand-in for the backend server binary, used by the proxier's
//! integration tests. Speaks just enough of the three forwarded services to
//! exercise session bring-up, data forwarding and log forwarding.

#![deny(warnings)]

use std::net::SocketAddr;
use std::pin::Pin;

use bytes::Bytes;
use clap::{Arg, Command};
use futures::{Stream, StreamExt};
use protos::sessionapi::data_streamer_server::{DataStreamer, DataStreamerServer};
use protos::sessionapi::driver_api_server::{DriverApi, DriverApiServer};
use protos::sessionapi::log_streamer_server::{LogStreamer, LogStreamerServer};
use protos::sessionapi::{
    data_request, data_response, ClientTask, ClientTaskTicket, ClusterInfoRequest,
    ClusterInfoResponse, ConnectionCleanupResponse, ConnectionInfoResponse, DataRequest,
    DataResponse, GetRequest, GetResponse, InitRequest, InitResponse, KvDelRequest, KvDelResponse,
    KvExistsRequest, KvExistsResponse, KvGetRequest, KvGetResponse, KvListRequest, KvListResponse,
    KvPutRequest, KvPutResponse, ListNamedActorsRequest, ListNamedActorsResponse, LogData,
    LogSettingsRequest, PinRuntimeEnvUriRequest, PinRuntimeEnvUriResponse, PutRequest,
    PutResponse, TerminateRequest, TerminateResponse, WaitRequest, WaitResponse,
};
use tonic::{Request, Response, Status, Streaming};

/// The bogus client count a dedicated backend reports; the proxier is
/// expected to rewrite it with the real aggregate.
const STUB_NUM_CLIENTS: i32 = 99;

#[derive(Clone, Default)]
struct StubBackend {
    runtime_env_context: String,
}

#[tonic::async_trait]
impl DriverApi for StubBackend {
    async fn init(&self, _request: Request<InitRequest>) -> Result<Response<InitResponse>, Status> {
        Ok(Response::new(InitResponse {
            ok: true,
            msg: String::new(),
        }))
    }

    async fn put_object(
        &self,
        request: Request<PutRequest>,
    ) -> Result<Response<PutResponse>, Status> {
        let size = request.into_inner().data.len();
        Ok(Response::new(PutResponse {
            id: Bytes::from(format!("object-{size}")),
            valid: true,
            error: String::new(),
        }))
    }

    type GetObjectStream = Pin<Box<dyn Stream<Item = Result<GetResponse, Status>> + Send>>;

    async fn get_object(
        &self,
        _request: Request<GetRequest>,
    ) -> Result<Response<Self::GetObjectStream>, Status> {
        let chunk = GetResponse {
            valid: true,
            data: Bytes::from_static(b"stub-object"),
            error: String::new(),
            chunk_id: 0,
            total_chunks: 1,
            total_size: 11,
        };
        Ok(Response::new(Box::pin(futures::stream::iter([Ok(chunk)]))))
    }

    async fn wait_object(
        &self,
        request: Request<WaitRequest>,
    ) -> Result<Response<WaitResponse>, Status> {
        let object_ids = request.into_inner().object_ids;
        Ok(Response::new(WaitResponse {
            valid: true,
            ready_ids: object_ids,
            remaining_ids: vec![],
        }))
    }

    async fn schedule(
        &self,
        _request: Request<ClientTask>,
    ) -> Result<Response<ClientTaskTicket>, Status> {
        Ok(Response::new(ClientTaskTicket {
            valid: true,
            return_ids: vec![Bytes::from_static(b"return-0")],
            error: String::new(),
        }))
    }

    async fn terminate(
        &self,
        _request: Request<TerminateRequest>,
    ) -> Result<Response<TerminateResponse>, Status> {
        Ok(Response::new(TerminateResponse { ok: true }))
    }

    async fn cluster_info(
        &self,
        _request: Request<ClusterInfoRequest>,
    ) -> Result<Response<ClusterInfoResponse>, Status> {
        Ok(Response::new(ClusterInfoResponse {
            json: format!(
                "{{\"runtime_env_context\": \"{}\"}}",
                self.runtime_env_context
            ),
        }))
    }

    async fn list_named_actors(
        &self,
        _request: Request<ListNamedActorsRequest>,
    ) -> Result<Response<ListNamedActorsResponse>, Status> {
        Ok(Response::new(ListNamedActorsResponse {
            actors_json: "[]".to_owned(),
        }))
    }

    async fn kv_put(
        &self,
        _request: Request<KvPutRequest>,
    ) -> Result<Response<KvPutResponse>, Status> {
        Ok(Response::new(KvPutResponse {
            already_exists: false,
        }))
    }

    async fn kv_get(
        &self,
        _request: Request<KvGetRequest>,
    ) -> Result<Response<KvGetResponse>, Status> {
        Ok(Response::new(KvGetResponse {
            value: Bytes::from_static(b"stub-value"),
        }))
    }

    async fn kv_del(
        &self,
        _request: Request<KvDelRequest>,
    ) -> Result<Response<KvDelResponse>, Status> {
        Ok(Response::new(KvDelResponse {}))
    }

    async fn kv_list(
        &self,
        _request: Request<KvListRequest>,
    ) -> Result<Response<KvListResponse>, Status> {
        Ok(Response::new(KvListResponse { keys: vec![] }))
    }

    async fn kv_exists(
        &self,
        _request: Request<KvExistsRequest>,
    ) -> Result<Response<KvExistsResponse>, Status> {
        Ok(Response::new(KvExistsResponse { exists: false }))
    }

    async fn pin_runtime_env_uri(
        &self,
        _request: Request<PinRuntimeEnvUriRequest>,
    ) -> Result<Response<PinRuntimeEnvUriResponse>, Status> {
        Ok(Response::new(PinRuntimeEnvUriResponse {}))
    }
}

#[tonic::async_trait]
impl DataStreamer for StubBackend {
    type DatapathStream = Pin<Box<dyn Stream<Item = Result<DataResponse, Status>> + Send>>;

    async fn datapath(
        &self,
        request: Request<Streaming<DataRequest>>,
    ) -> Result<Response<Self::DatapathStream>, Status> {
        let mut inbound = request.into_inner();
        let runtime_env_context = self.runtime_env_context.clone();

        let outbound = async_stream::try_stream! {
            while let Some(message) = inbound.next().await {
                let message = message?;
                let req_id = message.req_id;
                match message.r#type {
                    Some(data_request::Type::Init(_)) => {
                        // Echo the provisioned context so tests can observe
                        // what the backend was launched with.
                        yield DataResponse {
                            req_id,
                            r#type: Some(data_response::Type::Init(InitResponse {
                                ok: true,
                                msg: runtime_env_context.clone(),
                            })),
                        };
                    }
                    Some(data_request::Type::ConnectionInfo(_)) => {
                        yield DataResponse {
                            req_id,
                            r#type: Some(data_response::Type::ConnectionInfo(
                                ConnectionInfoResponse {
                                    num_clients: STUB_NUM_CLIENTS,
                                    cluster_id: "stub-cluster".to_owned(),
                                    protocol_version: "1".to_owned(),
                                },
                            )),
                        };
                    }
                    Some(data_request::Type::ConnectionCleanup(_)) => {
                        yield DataResponse {
                            req_id,
                            r#type: Some(data_response::Type::ConnectionCleanup(
                                ConnectionCleanupResponse {},
                            )),
                        };
                    }
                    _ => {
                        yield DataResponse { req_id, r#type: None };
                    }
                }
            }
        };
        Ok(Response::new(Box::pin(outbound)))
    }
}

#[tonic::async_trait]
impl LogStreamer for StubBackend {
    type LogstreamStream = Pin<Box<dyn Stream<Item = Result<LogData, Status>> + Send>>;

    async fn logstream(
        &self,
        request: Request<Streaming<LogSettingsRequest>>,
    ) -> Result<Response<Self::LogstreamStream>, Status> {
        let mut inbound = request.into_inner();
        let outbound = async_stream::try_stream! {
            while let Some(settings) = inbound.next().await {
                let settings = settings?;
                yield LogData {
                    msg: format!("logging enabled={}", settings.enabled),
                    level: settings.log_level,
                    name: "stub".to_owned(),
                };
            }
        };
        Ok(Response::new(Box::pin(outbound)))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("stub_backend")
        .arg(Arg::new("address").long("address"))
        .arg(Arg::new("port").long("port").required(true))
        .arg(Arg::new("runtime-env-context").long("runtime-env-context"))
        .get_matches();

    let port: u16 = matches.get_one::<String>("port").unwrap().parse()?;
    let runtime_env_context = matches
        .get_one::<String>("runtime-env-context")
        .cloned()
        .unwrap_or_default();

    let backend = StubBackend {
        runtime_env_context,
    };
    let address: SocketAddr = format!("127.0.0.1:{port}").parse()?;
    println!("stub backend server listening on {address}");

    tonic::transport::Server::builder()
        .add_service(DriverApiServer::new(backend.clone()))
        .add_service(DataStreamerServer::new(backend.clone()))
        .add_service(LogStreamerServer::new(backend))
        .serve(address)
        .await?;

    Ok(())
}
