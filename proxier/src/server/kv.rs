// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tonic::Status;

/// The narrow key-value surface the proxier answers locally before a
/// client's backend server exists; the working-directory upload path needs
/// it ahead of session init.
#[async_trait]
pub trait ClusterKv: Send + Sync + 'static {
    async fn put(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<bool, Status>;
    async fn get(&self, key: &[u8]) -> Result<Bytes, Status>;
    async fn del(&self, key: &[u8]) -> Result<(), Status>;
    async fn list(&self, prefix: &[u8]) -> Result<Vec<Bytes>, Status>;
    async fn exists(&self, key: &[u8]) -> Result<bool, Status>;
    async fn pin_runtime_env_uri(&self, uri: &str, expiration_s: i32) -> Result<(), Status>;
}

/// In-process store used when no cluster-backed key-value store is wired in.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<Vec<u8>, Bytes>>,
}

#[async_trait]
impl ClusterKv for MemoryKv {
    async fn put(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<bool, Status> {
        let mut entries = self.entries.lock();
        let exists = entries.contains_key(key);
        if !exists || overwrite {
            entries.insert(key.to_vec(), Bytes::copy_from_slice(value));
        }
        Ok(exists)
    }

    async fn get(&self, key: &[u8]) -> Result<Bytes, Status> {
        Ok(self.entries.lock().get(key).cloned().unwrap_or_default())
    }

    async fn del(&self, key: &[u8]) -> Result<(), Status> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &[u8]) -> Result<Vec<Bytes>, Status> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .map(|key| Bytes::copy_from_slice(key))
            .collect())
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, Status> {
        Ok(self.entries.lock().contains_key(key))
    }

    async fn pin_runtime_env_uri(&self, _uri: &str, _expiration_s: i32) -> Result<(), Status> {
        // Nothing to pin: entries never expire out of process memory.
        Ok(())
    }
}
