//! Capability surface between the session supervisor and the container
//! runtime.
//!
//! The supervisor hands the runtime a bundle of byte streams plus a resize
//! feed; the runtime hands back a channel that yields the task's exit status
//! once, if it exits on its own, and closes after teardown.

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Terminal dimensions carried through from the SSH client. Pixel sizes are
/// accepted on the wire but not interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub columns: u32,
    pub rows: u32,
}

/// Terminal outcome of a container task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,

    /// Populated only when the task terminated abnormally.
    pub error: Option<String>,
}

/// The byte streams and resize feed a spawned task is wired to.
///
/// `stdout` is owned by the spawner and shut down after the task's last
/// output byte, before the exit status is emitted.
pub struct InteractiveStreams {
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,

    /// Present only if the client requested a PTY.
    pub initial_size: Option<TermSize>,

    /// Later window-change events. Bounded; delivery is best-effort.
    pub updates: mpsc::Receiver<TermSize>,
}

#[async_trait]
pub trait Manager: Send + Sync {
    /// Idempotently pull and unpack `image_ref` so later spawns are fast.
    /// Safe to call concurrently for the same reference.
    async fn prepare(&self, image_ref: &str) -> Result<()>;
}

#[async_trait]
pub trait Spawner: Send + Sync {
    /// Create and start a task running `argv` in a fresh container of
    /// `image_ref`, wired to `streams`.
    ///
    /// The returned channel yields at most one `ExitStatus` and is closed
    /// once the container has been torn down. Triggering `cancel` tears the
    /// task down without emitting a status.
    async fn spawn(
        &self,
        image_ref: &str,
        argv: Vec<String>,
        streams: InteractiveStreams,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ExitStatus>>;
}

pub trait ManagerSpawner: Manager + Spawner {}

impl<T: Manager + Spawner> ManagerSpawner for T {}
