// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spawner trait definitions.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use shardline_protocol::{IpcError, ManagerMessage, WorkerMessage};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::model::{SpawnRequest, WorkerId};

/// Errors from spawner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpawnError {
    /// The process could not be started.
    #[error("Failed to start process: {0}")]
    StartFailed(#[from] std::io::Error),

    /// A stdio pipe was not available after spawn.
    #[error("Missing {0} pipe")]
    MissingPipe(&'static str),

    /// The process exited before its pid could be read.
    #[error("Process exited immediately")]
    ExitedImmediately,

    /// Delivering a signal failed.
    #[error("Failed to signal pid {pid}: {reason}")]
    Signal {
        /// Target pid.
        pid: u32,
        /// OS error.
        reason: String,
    },

    /// Writing to the process's IPC channel failed.
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Signal number, when the process was killed by a signal.
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Normal exit with `code`.
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Killed by `signal`.
    pub fn signaled(signal: Signal) -> Self {
        Self {
            code: None,
            signal: Some(signal as i32),
        }
    }

    /// Signal name such as `SIGKILL`, when killed by a known signal.
    pub fn signal_name(&self) -> Option<&'static str> {
        self.signal
            .and_then(|number| Signal::try_from(number).ok())
            .map(|signal| signal.as_str())
    }

    /// True when the process was stopped with the graceful-termination
    /// signal. Such exits are never auto-restarted.
    pub fn is_graceful_termination(&self) -> bool {
        self.signal == Some(Signal::SIGTERM as i32)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.signal_name(), self.signal, self.code) {
            (Some(name), _, _) => write!(f, "{}", name),
            (None, Some(number), _) => write!(f, "signal {}", number),
            (None, None, Some(code)) => write!(f, "{}", code),
            (None, None, None) => write!(f, "unknown status"),
        }
    }
}

/// Handle for talking to and signalling a live process.
#[async_trait]
pub trait ProcessControl: Send + Sync + fmt::Debug {
    /// OS pid.
    fn pid(&self) -> u32;

    /// Write one IPC message to the process.
    async fn send(&self, message: &ManagerMessage) -> Result<(), SpawnError>;

    /// Deliver a signal.
    fn signal(&self, signal: Signal) -> Result<(), SpawnError>;
}

/// A freshly started process.
pub struct SpawnedProcess {
    /// OS pid.
    pub pid: u32,
    /// Control handle.
    pub control: Arc<dyn ProcessControl>,
    /// Decoded IPC messages from the process, in order.
    pub messages: mpsc::UnboundedReceiver<WorkerMessage>,
    /// Resolves once when the process exits, after all of its messages
    /// have been delivered.
    pub exit: oneshot::Receiver<ExitInfo>,
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Non-IPC stdout line.
    Stdout,
    /// stderr line.
    Stderr,
}

/// One line of child output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    /// Producing process.
    pub pid: u32,
    /// Worker the process belongs to.
    pub worker: WorkerId,
    /// Cluster id, for cluster workers.
    pub cluster_id: Option<u32>,
    /// True for the cluster manager role.
    pub manager: bool,
    /// When the producing process was spawned.
    pub created_at: DateTime<Utc>,
    /// Source pipe.
    pub stream: OutputStream,
    /// Line without the trailing newline.
    pub text: String,
}

/// Receives child output lines (e.g. the log stream server).
pub trait OutputSink: Send + Sync {
    /// Handle one line. Must not block.
    fn line(&self, line: OutputLine);
}

/// Starts worker processes.
///
/// Spawners are pure process plumbing: they know nothing about restarts or
/// registries. Supervision is layered on top by [`crate::worker::WorkerHandle`].
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Spawner type identifier (e.g. "native", "mock").
    fn spawner_type(&self) -> &'static str;

    /// Start a process for `request` and return immediately.
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, SpawnError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_display() {
        assert_eq!(ExitInfo::signaled(Signal::SIGKILL).to_string(), "SIGKILL");
        assert_eq!(ExitInfo::code(1).to_string(), "1");
        assert_eq!(ExitInfo::default().to_string(), "unknown status");
    }

    #[test]
    fn test_graceful_termination() {
        assert!(ExitInfo::signaled(Signal::SIGTERM).is_graceful_termination());
        assert!(!ExitInfo::signaled(Signal::SIGKILL).is_graceful_termination());
        assert!(!ExitInfo::code(0).is_graceful_termination());
    }
}
