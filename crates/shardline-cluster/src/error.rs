// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for shardline-cluster.

use std::time::Duration;

use thiserror::Error;

use crate::model::WorkerId;
use crate::runner::ExitInfo;

/// Cluster errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Partitioning input was rejected.
    #[error("Partition error: {0}")]
    Partition(#[from] crate::partition::PartitionError),

    /// Spawning or signalling a process failed.
    #[error("Spawn error: {0}")]
    Spawn(#[from] crate::runner::SpawnError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// RPC call to another process failed.
    #[error("RPC error: {0}")]
    Rpc(#[from] shardline_protocol::ClientError),

    /// Starting an RPC server failed.
    #[error("RPC server error: {0}")]
    RpcServer(#[from] shardline_protocol::ServerError),

    /// IPC channel failed.
    #[error("IPC error: {0}")]
    Ipc(#[from] shardline_protocol::IpcError),

    /// Webhook or gateway HTTP call failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The gateway shard estimate could not be obtained.
    #[error("Shard count unavailable: {0}")]
    ShardCountUnavailable(String),

    /// No worker/cluster with this id.
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    /// A stored record is malformed.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// The replacement process did not report ready in time.
    #[error("Worker {worker} did not become ready within {timeout:?}")]
    ReadyTimeout {
        /// Worker being (re)started.
        worker: WorkerId,
        /// Configured bound.
        timeout: Duration,
    },

    /// The process exited before reporting ready.
    #[error("Worker {worker} exited before becoming ready ({exit})")]
    WorkerExited {
        /// Worker being (re)started.
        worker: WorkerId,
        /// How it exited.
        exit: ExitInfo,
    },

    /// The worker has no live process to talk to.
    #[error("Worker {0} is not running")]
    WorkerNotRunning(WorkerId),

    /// The worker answered a request with an error.
    #[error("Worker {worker} replied with error: {message}")]
    WorkerReply {
        /// Worker that answered.
        worker: WorkerId,
        /// Error text from the worker.
        message: String,
    },

    /// A request to a worker was not answered in time.
    #[error("IPC request timed out.")]
    RequestTimeout,

    /// The worker was removed while an operation was pending.
    #[error("Worker {0} was removed")]
    WorkerRemoved(WorkerId),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using cluster Error.
pub type Result<T> = std::result::Result<T, Error>;
