// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("bundled protoc binary"),
    );

    let mut config = prost_build::Config::new();
    config.bytes(["."]);

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_with_config(
            config,
            &[
                "protos/sessionapi/session_api.proto",
                "protos/runtimeenv/runtime_env_agent.proto",
            ],
            &["protos"],
        )?;

    Ok(())
}
