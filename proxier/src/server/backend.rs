// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::process::ExitStatus;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::process::Child;
use tokio::sync::watch;
use tonic::transport::Channel;

/// A spawned backend server process.
pub struct BackendProcess {
    pid: u32,
    child: Mutex<Child>,
}

impl BackendProcess {
    pub(crate) fn new(pid: u32, child: Child) -> BackendProcess {
        BackendProcess {
            pid,
            child: Mutex::new(child),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check whether the process has exited, without blocking.
    pub fn poll_exit(&self) -> Option<ExitStatus> {
        self.child.lock().try_wait().ok().flatten()
    }

    /// Best-effort kill signal.
    pub fn kill(&self) {
        let _ = self.child.lock().start_kill();
    }
}

/// Outcome slot of the one-shot backend spawn.
#[derive(Clone, Default)]
enum ProcessSlot {
    /// The spawn has not completed yet.
    #[default]
    Unset,
    /// The spawn (or the session that owned it) failed; the channel must not
    /// be used.
    Failed,
    Running(Arc<BackendProcess>),
}

/// One per-client backend server: its port, a client channel to it, and the
/// one-shot outcome of spawning it.
///
/// The channel is created at registration, before the process exists, and is
/// only handed out once the slot resolves to a live process.
pub struct BackendHandle {
    port: u16,
    channel: Channel,
    slot: watch::Sender<ProcessSlot>,
}

impl BackendHandle {
    pub(crate) fn new(port: u16, channel: Channel) -> BackendHandle {
        let (slot, _) = watch::channel(ProcessSlot::Unset);
        BackendHandle {
            port,
            channel,
            slot,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Whether the spawn outcome is known. Does not block.
    pub fn is_ready(&self) -> bool {
        !matches!(*self.slot.borrow(), ProcessSlot::Unset)
    }

    /// Fix the spawn outcome; `None` is the failure sentinel. The first call
    /// wins and later calls are ignored.
    pub fn set_result(&self, process: Option<Arc<BackendProcess>>) {
        self.slot.send_if_modified(|slot| {
            if !matches!(slot, ProcessSlot::Unset) {
                return false;
            }
            *slot = match process {
                Some(process) => ProcessSlot::Running(process),
                None => ProcessSlot::Failed,
            };
            true
        });
    }

    /// Wait for the spawn outcome, failing if it resolved to the failure
    /// sentinel.
    pub async fn wait_ready(&self) -> Result<Arc<BackendProcess>, String> {
        let mut receiver = self.slot.subscribe();
        loop {
            match &*receiver.borrow_and_update() {
                ProcessSlot::Unset => {}
                ProcessSlot::Failed => return Err("backend server startup failed".to_owned()),
                ProcessSlot::Running(process) => return Ok(process.clone()),
            }
            if receiver.changed().await.is_err() {
                return Err("backend server handle was dropped".to_owned());
            }
        }
    }

    /// Whether the process has exited. `None` while the spawn is unresolved,
    /// resolved to the failure sentinel, or the process is still running.
    pub fn poll_exit(&self) -> Option<ExitStatus> {
        match &*self.slot.borrow() {
            ProcessSlot::Running(process) => process.poll_exit(),
            _ => None,
        }
    }

    /// Best-effort kill. A no-op if the spawn has not resolved to a process.
    pub fn kill(&self) {
        if let ProcessSlot::Running(process) = &*self.slot.borrow() {
            process.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use grpc_util::backend::loopback_channel;
    use tokio::process::Command;

    use super::{BackendHandle, BackendProcess};

    fn test_handle() -> BackendHandle {
        BackendHandle::new(25999, loopback_channel(25999).unwrap())
    }

    fn spawn_sleeper() -> Arc<BackendProcess> {
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap_or_default();
        Arc::new(BackendProcess::new(pid, child))
    }

    #[tokio::test]
    async fn set_result_is_one_shot() {
        let handle = test_handle();
        assert!(!handle.is_ready());

        handle.set_result(None);
        assert!(handle.is_ready());
        assert!(handle.wait_ready().await.is_err());

        // A later, different outcome must not overwrite the first.
        let process = spawn_sleeper();
        handle.set_result(Some(process.clone()));
        assert!(handle.wait_ready().await.is_err());
        process.kill();
    }

    #[tokio::test]
    async fn wait_ready_unblocks_on_resolution() {
        let handle = Arc::new(test_handle());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let process = spawn_sleeper();
        handle.set_result(Some(process));

        let process = waiter.await.unwrap().expect("resolved to a process");
        assert!(process.poll_exit().is_none());
        process.kill();
    }

    #[tokio::test]
    async fn poll_exit_reports_termination() {
        let handle = test_handle();
        let process = spawn_sleeper();
        handle.set_result(Some(process));
        assert!(handle.poll_exit().is_none());

        handle.kill();
        // Killing is asynchronous; give the process a moment to die.
        for _ in 0..50 {
            if handle.poll_exit().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("killed backend process never reported an exit status");
    }
}
