// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

mod server;

pub use server::{
    BackendHandle, BackendLaunchConfig, BackendProcess, ClusterBootstrap, ClusterKv, JobConfig,
    MemoryKv, PortRangeConfig, RegisterError, RuntimeEnvProvisioner, SessionManager,
    SessionProxy, SessionTimeouts, CLIENT_ID_METADATA_KEY, RECONNECTING_METADATA_KEY,
};
