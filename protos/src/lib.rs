// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::derive_partial_eq_without_eq)]

pub mod sessionapi {
    include!(concat!(env!("OUT_DIR"), "/sessionapi.rs"));
}

pub mod runtimeenv {
    include!(concat!(env!("OUT_DIR"), "/runtimeenv.rs"));
}
