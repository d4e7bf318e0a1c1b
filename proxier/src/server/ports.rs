// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::net::TcpListener;

/// Pool of TCP ports available for backend servers.
///
/// The free list is advisory: the port range is shared with the host, so
/// `acquire` probes each candidate with a real bind. A port that fails to
/// bind rotates to the tail and the scan continues, bounded to one pass over
/// the list.
pub(crate) struct PortPool {
    free: VecDeque<u16>,
}

impl PortPool {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> PortPool {
        PortPool {
            free: ports.into_iter().collect(),
        }
    }

    /// Take a usable port out of the pool.
    ///
    /// The probe socket is closed before the port is used, so a small window
    /// remains in which the host can steal it. Spawning the backend
    /// immediately keeps the window short, and a collision surfaces as
    /// backend startup failure.
    pub fn acquire(&mut self) -> Result<u16, String> {
        for _ in 0..self.free.len() {
            let port = match self.free.pop_front() {
                Some(port) => port,
                None => break,
            };
            match TcpListener::bind(("0.0.0.0", port)) {
                Ok(listener) => {
                    drop(listener);
                    return Ok(port);
                }
                Err(_) => self.free.push_back(port),
            }
        }
        Err("no free ports remain in the backend port range".to_owned())
    }

    /// Return a port to the pool.
    pub fn release(&mut self, port: u16) {
        self.free.push_back(port);
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}
