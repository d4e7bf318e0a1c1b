// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use tonic::body::BoxBody;
use tonic::transport::{Channel, Endpoint};
use tower::Service;

/// Construct a lazily-connecting channel to a server on the loopback
/// interface.
///
/// The channel is usable immediately: the underlying HTTP/2 connection is
/// established on first use and re-established after failures, which allows
/// creating the channel before the server process has even been spawned.
pub fn loopback_channel(port: u16) -> Result<Channel, String> {
    let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))
        .map_err(|err| format!("invalid loopback uri for port {port}: {err}"))?
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_while_idle(true);
    Ok(endpoint.connect_lazy())
}

/// Wait until `channel` has an established transport, retrying failed
/// connection attempts until `limit` has elapsed.
pub async fn wait_until_ready(channel: &Channel, limit: Duration) -> Result<(), String> {
    let deadline = tokio::time::Instant::now() + limit;
    let mut channel = channel.clone();
    let mut last_error: Option<String> = None;
    loop {
        let ready = futures::future::poll_fn(|cx| {
            <Channel as Service<http::Request<BoxBody>>>::poll_ready(&mut channel, cx)
        });
        match tokio::time::timeout_at(deadline, ready).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => {
                // The target may simply not be listening yet.
                last_error = Some(err.to_string());
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(_) => break,
        }
    }
    Err(match last_error {
        Some(err) => format!("channel not ready within {limit:?}; last error: {err}"),
        None => format!("channel not ready within {limit:?}"),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{loopback_channel, wait_until_ready};

    #[tokio::test]
    async fn unreachable_channel_times_out() {
        // Nothing listens on the port; readiness must fail within the limit
        // rather than hanging.
        let channel = loopback_channel(1).unwrap();
        let started = tokio::time::Instant::now();
        let result = wait_until_ready(&channel, Duration::from_millis(500)).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn listening_channel_becomes_ready() {
        use hyper::service::{make_service_fn, service_fn};

        let make_svc = make_service_fn(|_conn| async {
            Ok::<_, hyper::Error>(service_fn(|_req| async {
                Ok::<_, hyper::Error>(hyper::Response::new(hyper::Body::empty()))
            }))
        });
        let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap())
            .http2_only(true)
            .serve(make_svc);
        let port = server.local_addr().port();
        tokio::spawn(server);

        let channel = loopback_channel(port).unwrap();
        wait_until_ready(&channel, Duration::from_secs(5))
            .await
            .expect("channel ready");
    }
}
