// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use protos::sessionapi::driver_api_client::DriverApiClient;
use protos::sessionapi::driver_api_server::DriverApi;
use protos::sessionapi::{
    ClientTask, ClientTaskTicket, ClusterInfoRequest, ClusterInfoResponse, ClusterInfoType,
    GetRequest, GetResponse, InitRequest, InitResponse, KvDelRequest, KvDelResponse,
    KvExistsRequest, KvExistsResponse, KvGetRequest, KvGetResponse, KvListRequest, KvListResponse,
    KvPutRequest, KvPutResponse, ListNamedActorsRequest, ListNamedActorsResponse,
    PinRuntimeEnvUriRequest, PinRuntimeEnvUriResponse, PutRequest, PutResponse, TerminateRequest,
    TerminateResponse, WaitRequest, WaitResponse,
};
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use crate::server::kv::ClusterKv;
use crate::server::manager::SessionManager;
use crate::server::{client_id_from_metadata, forward_one, forwarded_request};

/// Terminates the driver control service and forwards each call onto the
/// caller's backend server.
pub(crate) struct DriverService {
    manager: Arc<SessionManager>,
    kv: Arc<dyn ClusterKv>,
}

impl DriverService {
    pub const SERVICE_NAME: &'static str = "sessionapi.DriverApi";

    pub(crate) fn new(manager: Arc<SessionManager>, kv: Arc<dyn ClusterKv>) -> Self {
        DriverService { manager, kv }
    }

    /// Resolve the caller's backend client, blocking until the backend has
    /// started and its channel is ready.
    async fn backend_client(
        &self,
        metadata: &MetadataMap,
    ) -> Result<DriverApiClient<Channel>, Status> {
        let client_id = client_id_from_metadata(metadata)
            .ok_or_else(|| Status::invalid_argument("missing client_id in request metadata"))?;
        match self.manager.channel_for(&client_id).await {
            Some(channel) => Ok(DriverApiClient::new(channel)),
            None => {
                log::error!("channel for client {client_id} not found");
                Err(Status::not_found(format!(
                    "no active session for client {client_id}"
                )))
            }
        }
    }

    /// Whether the caller already has a started backend. Key-value requests
    /// that arrive earlier are answered from the cluster store directly.
    fn has_backend(&self, metadata: &MetadataMap) -> bool {
        client_id_from_metadata(metadata)
            .map(|client_id| self.manager.has_channel(&client_id))
            .unwrap_or(false)
    }
}

#[tonic::async_trait]
impl DriverApi for DriverService {
    #[tracing::instrument(skip_all)]
    async fn init(&self, request: Request<InitRequest>) -> Result<Response<InitResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        let mut client = self.backend_client(&metadata).await?;
        forward_one(
            client.init(forwarded_request(&metadata, message)),
            Self::SERVICE_NAME,
            "Init",
        )
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn put_object(
        &self,
        request: Request<PutRequest>,
    ) -> Result<Response<PutResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        let mut client = self.backend_client(&metadata).await?;
        forward_one(
            client.put_object(forwarded_request(&metadata, message)),
            Self::SERVICE_NAME,
            "PutObject",
        )
        .await
    }

    type GetObjectStream = tonic::codec::Streaming<GetResponse>;

    #[tracing::instrument(skip_all)]
    async fn get_object(
        &self,
        request: Request<GetRequest>,
    ) -> Result<Response<Self::GetObjectStream>, Status> {
        let (metadata, _, message) = request.into_parts();
        let mut client = self.backend_client(&metadata).await?;
        forward_one(
            client.get_object(forwarded_request(&metadata, message)),
            Self::SERVICE_NAME,
            "GetObject",
        )
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn wait_object(
        &self,
        request: Request<WaitRequest>,
    ) -> Result<Response<WaitResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        let mut client = self.backend_client(&metadata).await?;
        forward_one(
            client.wait_object(forwarded_request(&metadata, message)),
            Self::SERVICE_NAME,
            "WaitObject",
        )
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn schedule(
        &self,
        request: Request<ClientTask>,
    ) -> Result<Response<ClientTaskTicket>, Status> {
        let (metadata, _, message) = request.into_parts();
        let mut client = self.backend_client(&metadata).await?;
        forward_one(
            client.schedule(forwarded_request(&metadata, message)),
            Self::SERVICE_NAME,
            "Schedule",
        )
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn terminate(
        &self,
        request: Request<TerminateRequest>,
    ) -> Result<Response<TerminateResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        let mut client = self.backend_client(&metadata).await?;
        forward_one(
            client.terminate(forwarded_request(&metadata, message)),
            Self::SERVICE_NAME,
            "Terminate",
        )
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn cluster_info(
        &self,
        request: Request<ClusterInfoRequest>,
    ) -> Result<Response<ClusterInfoResponse>, Status> {
        // Pings are answered locally: the driver's initial handshake must
        // succeed before any session (and thus any backend) exists.
        if request.get_ref().r#type == ClusterInfoType::Ping as i32 {
            return Ok(Response::new(ClusterInfoResponse {
                json: serde_json::json!({}).to_string(),
            }));
        }
        let (metadata, _, message) = request.into_parts();
        let mut client = self.backend_client(&metadata).await?;
        forward_one(
            client.cluster_info(forwarded_request(&metadata, message)),
            Self::SERVICE_NAME,
            "ClusterInfo",
        )
        .await
    }

    #[tracing::instrument(skip_all)]
    async fn list_named_actors(
        &self,
        request: Request<ListNamedActorsRequest>,
    ) -> Result<Response<ListNamedActorsResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        let mut client = self.backend_client(&metadata).await?;
        forward_one(
            client.list_named_actors(forwarded_request(&metadata, message)),
            Self::SERVICE_NAME,
            "ListNamedActors",
        )
        .await
    }

    // The five KV calls and PinRuntimeEnvURI double as the pre-session
    // fallback: before a backend exists for the caller they are answered from
    // the cluster store, so that working-directory uploads can proceed ahead
    // of session init.

    #[tracing::instrument(skip_all)]
    async fn kv_put(
        &self,
        request: Request<KvPutRequest>,
    ) -> Result<Response<KvPutResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        if self.has_backend(&metadata) {
            let mut client = self.backend_client(&metadata).await?;
            return forward_one(
                client.kv_put(forwarded_request(&metadata, message)),
                Self::SERVICE_NAME,
                "KVPut",
            )
            .await;
        }
        let already_exists = self
            .kv
            .put(&message.key, &message.value, message.overwrite)
            .await?;
        Ok(Response::new(KvPutResponse { already_exists }))
    }

    #[tracing::instrument(skip_all)]
    async fn kv_get(
        &self,
        request: Request<KvGetRequest>,
    ) -> Result<Response<KvGetResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        if self.has_backend(&metadata) {
            let mut client = self.backend_client(&metadata).await?;
            return forward_one(
                client.kv_get(forwarded_request(&metadata, message)),
                Self::SERVICE_NAME,
                "KVGet",
            )
            .await;
        }
        let value = self.kv.get(&message.key).await?;
        Ok(Response::new(KvGetResponse { value }))
    }

    #[tracing::instrument(skip_all)]
    async fn kv_del(
        &self,
        request: Request<KvDelRequest>,
    ) -> Result<Response<KvDelResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        if self.has_backend(&metadata) {
            let mut client = self.backend_client(&metadata).await?;
            return forward_one(
                client.kv_del(forwarded_request(&metadata, message)),
                Self::SERVICE_NAME,
                "KVDel",
            )
            .await;
        }
        self.kv.del(&message.key).await?;
        Ok(Response::new(KvDelResponse {}))
    }

    #[tracing::instrument(skip_all)]
    async fn kv_list(
        &self,
        request: Request<KvListRequest>,
    ) -> Result<Response<KvListResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        if self.has_backend(&metadata) {
            let mut client = self.backend_client(&metadata).await?;
            return forward_one(
                client.kv_list(forwarded_request(&metadata, message)),
                Self::SERVICE_NAME,
                "KVList",
            )
            .await;
        }
        let keys = self.kv.list(&message.prefix).await?;
        Ok(Response::new(KvListResponse { keys }))
    }

    #[tracing::instrument(skip_all)]
    async fn kv_exists(
        &self,
        request: Request<KvExistsRequest>,
    ) -> Result<Response<KvExistsResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        if self.has_backend(&metadata) {
            let mut client = self.backend_client(&metadata).await?;
            return forward_one(
                client.kv_exists(forwarded_request(&metadata, message)),
                Self::SERVICE_NAME,
                "KVExists",
            )
            .await;
        }
        let exists = self.kv.exists(&message.key).await?;
        Ok(Response::new(KvExistsResponse { exists }))
    }

    #[tracing::instrument(skip_all)]
    async fn pin_runtime_env_uri(
        &self,
        request: Request<PinRuntimeEnvUriRequest>,
    ) -> Result<Response<PinRuntimeEnvUriResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        if self.has_backend(&metadata) {
            let mut client = self.backend_client(&metadata).await?;
            return forward_one(
                client.pin_runtime_env_uri(forwarded_request(&metadata, message)),
                Self::SERVICE_NAME,
                "PinRuntimeEnvURI",
            )
            .await;
        }
        self.kv
            .pin_runtime_env_uri(&message.uri, message.expiration_s)
            .await?;
        Ok(Response::new(PinRuntimeEnvUriResponse {}))
    }
}
