// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use tracing_subscriber::filter::targets::Targets;
use tracing_subscriber::prelude::*;

/// Configure logging for a binary.
///
/// Note: This cannot use `EnvFilter` because EnvFilter filters globally even
/// if it is only used in a tracing stack!
pub fn setup_logging(service_name: &'static str) {
    let filter_layer = {
        let directive = std::env::var("RUST_LOG")
            .ok()
            .unwrap_or_else(|| "info".to_owned());
        directive
            .parse::<Targets>()
            .expect("Failed to parse RUST_LOG")
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_filter(filter_layer);

    tracing_subscriber::registry().with(fmt_layer).init();

    log::info!("logging initialized for {service_name}");
}
