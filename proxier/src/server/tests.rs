// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;
use std::time::Duration;

use protos::sessionapi::driver_api_server::DriverApi;
use protos::sessionapi::{
    ClusterInfoRequest, ClusterInfoType, KvExistsRequest, KvGetRequest, KvPutRequest, WaitRequest,
};
use tonic::{Code, Request};

use crate::server::driver_service::DriverService;
use crate::server::kv::MemoryKv;
use crate::server::manager::SessionManager;
use crate::server::{
    client_id_from_metadata, forwarded_metadata, reconnecting_from_metadata, BackendLaunchConfig,
    PortRangeConfig, SessionTimeouts,
};

const TEST_PORT_RANGE: usize = 10;

fn test_manager(port_min: u16) -> (Arc<SessionManager>, tempfile::TempDir) {
    let log_dir = tempfile::tempdir().unwrap();
    let launch = BackendLaunchConfig {
        program: "/bin/sh".to_owned(),
        args: vec!["-c".to_owned(), "exec sleep 30".to_owned()],
        log_dir: log_dir.path().to_owned(),
        ready_match: "sleep".to_owned(),
    };
    let manager = SessionManager::new(
        Some("127.0.0.1:16379".to_owned()),
        None,
        launch,
        PortRangeConfig {
            min: port_min,
            max: port_min + TEST_PORT_RANGE as u16,
        },
        SessionTimeouts {
            channel_ready: Duration::from_secs(1),
            ..Default::default()
        },
        None,
    )
    .unwrap();
    (manager, log_dir)
}

fn request_for<T>(client_id: &str, message: T) -> Request<T> {
    let mut request = Request::new(message);
    request
        .metadata_mut()
        .insert("client_id", client_id.parse().unwrap());
    request
}

#[tokio::test]
async fn ping_is_answered_without_a_session() {
    let (manager, _log_dir) = test_manager(27800);
    let service = DriverService::new(manager.clone(), Arc::new(MemoryKv::default()));

    let response = service
        .cluster_info(request_for(
            "c3",
            ClusterInfoRequest {
                r#type: ClusterInfoType::Ping as i32,
            },
        ))
        .await
        .unwrap();
    assert_eq!(response.get_ref().json, "{}");

    // The handshake must not create any session state.
    assert!(!manager.is_registered("c3"));
    assert_eq!(manager.num_clients(), 0);
    assert_eq!(manager.free_port_count(), TEST_PORT_RANGE);
}

#[tokio::test]
async fn kv_requests_fall_back_before_a_session_exists() {
    let (manager, _log_dir) = test_manager(27810);
    let service = DriverService::new(manager.clone(), Arc::new(MemoryKv::default()));

    let put = service
        .kv_put(request_for(
            "c9",
            KvPutRequest {
                key: "working_dir/pkg".into(),
                value: "archive-bytes".into(),
                overwrite: false,
            },
        ))
        .await
        .unwrap();
    assert!(!put.get_ref().already_exists);

    let get = service
        .kv_get(request_for(
            "c9",
            KvGetRequest {
                key: "working_dir/pkg".into(),
            },
        ))
        .await
        .unwrap();
    assert_eq!(get.get_ref().value.as_ref(), b"archive-bytes");

    let exists = service
        .kv_exists(request_for(
            "c9",
            KvExistsRequest {
                key: "working_dir/pkg".into(),
            },
        ))
        .await
        .unwrap();
    assert!(exists.get_ref().exists);

    // The fallback never allocates a backend.
    assert!(!manager.is_registered("c9"));
    assert_eq!(manager.free_port_count(), TEST_PORT_RANGE);
}

#[tokio::test]
async fn unknown_client_gets_not_found() {
    let (manager, _log_dir) = test_manager(27820);
    let service = DriverService::new(manager, Arc::new(MemoryKv::default()));

    let err = service
        .wait_object(request_for("ghost", WaitRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn missing_client_id_is_rejected() {
    let (manager, _log_dir) = test_manager(27830);
    let service = DriverService::new(manager, Arc::new(MemoryKv::default()));

    let err = service
        .wait_object(Request::new(WaitRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[test]
fn metadata_extraction() {
    let request = request_for("c1", ());
    assert_eq!(
        client_id_from_metadata(request.metadata()).as_deref(),
        Some("c1")
    );
    assert!(!reconnecting_from_metadata(request.metadata()));

    let mut request = request_for("c1", ());
    request
        .metadata_mut()
        .insert("reconnecting", "True".parse().unwrap());
    assert!(reconnecting_from_metadata(request.metadata()));

    let mut request = Request::new(());
    request.metadata_mut().insert("client_id", "".parse().unwrap());
    assert_eq!(client_id_from_metadata(request.metadata()), None);
}

#[test]
fn forwarded_metadata_strips_transport_headers() {
    let mut request = request_for("c1", ());
    request
        .metadata_mut()
        .insert("user-agent", "grpc-rust/0.0".parse().unwrap());
    request
        .metadata_mut()
        .insert("x-tracing-id", "abc123".parse().unwrap());

    let forwarded = forwarded_metadata(request.metadata());
    assert_eq!(forwarded.get("client_id").unwrap(), "c1");
    assert_eq!(forwarded.get("x-tracing-id").unwrap(), "abc123");
    assert!(forwarded.get("user-agent").is_none());
}
