//! Interruption signals shared by the supervisor and the workers.
//!
//! Handlers are installed as soon as [`Interruptions::listen`] returns, so a
//! signal that arrives before anyone awaits [`Interruptions::recv`] is queued
//! rather than killing the process. Once installed they stay installed: a
//! second signal during teardown no longer terminates the process.

use anyhow::Result;
#[cfg(unix)]
use anyhow::Context;
#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::debug;

pub struct Interruptions {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
    #[cfg(unix)]
    hangup: Signal,
}

impl Interruptions {
    #[cfg(unix)]
    pub fn listen() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?,
            terminate: signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?,
            hangup: signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?,
        })
    }

    #[cfg(not(unix))]
    pub fn listen() -> Result<Self> {
        Ok(Self {})
    }

    /// Waits for the next interruption and returns the signal name.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "Ctrl-C"
    }
}

/// Asks each worker process to stop after its current module.
#[cfg(unix)]
pub async fn forward_terminate(pids: &[u32]) {
    for pid in pids {
        match tokio::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .output()
            .await
        {
            Ok(output) if output.status.success() => debug!(pid, "forwarded SIGTERM"),
            Ok(output) => debug!(pid, status = %output.status, "worker already gone"),
            Err(err) => debug!(pid, "failed to send SIGTERM: {err}"),
        }
    }
}

/// Workers share the console and receive Ctrl-C themselves.
#[cfg(not(unix))]
pub async fn forward_terminate(pids: &[u32]) {
    debug!(workers = pids.len(), "leaving interruption to the console");
}
