// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor <-> child messages over stdin/stdout.
//!
//! Each message is one line of JSON shaped `{"op": <name>, "d": <payload>}`.
//! The op sets are closed: decoding an unknown op is an error rather than a
//! dynamic lookup. Lines that are not JSON at all are passed through as
//! [`Incoming::Text`] so a child that prints to stdout does not break the
//! channel.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

/// IPC encode/decode/transport errors.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Line was not JSON, or an envelope field had the wrong shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Envelope named an op outside the closed set.
    #[error("unknown op: {0}")]
    UnknownOp(String),

    /// Op was known but its payload did not match.
    #[error("invalid payload for op '{op}': {source}")]
    InvalidPayload {
        /// Op being decoded.
        op: String,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// Pipe read/write failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The other side is gone.
    #[error("IPC channel closed")]
    ChannelClosed,
}

/// Fixed set of read-only diagnostics a worker can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticQuery {
    /// Per-shard connection status.
    Shards,
    /// Process statistics (memory, uptime, guild count).
    Stats,
    /// Liveness.
    Ping,
}

impl DiagnosticQuery {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticQuery::Shards => "shards",
            DiagnosticQuery::Stats => "stats",
            DiagnosticQuery::Ping => "ping",
        }
    }
}

impl std::str::FromStr for DiagnosticQuery {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shards" => Ok(DiagnosticQuery::Shards),
            "stats" => Ok(DiagnosticQuery::Stats),
            "ping" => Ok(DiagnosticQuery::Ping),
            other => Err(IpcError::UnknownOp(other.to_string())),
        }
    }
}

/// A correlated diagnostic request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Correlation id, unique per sender.
    pub id: u64,
    /// What is being asked.
    pub query: DiagnosticQuery,
}

/// Successful answer to a [`QueryRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Correlation id of the request.
    pub id: u64,
    /// Query result.
    pub result: Value,
}

/// Failed answer to a [`QueryRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    /// Correlation id of the request.
    pub id: u64,
    /// Error text.
    pub error: String,
}

/// A shard dropped its gateway connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDisconnect {
    /// Shard id.
    pub id: u32,
    /// Close reason, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// Messages a child process sends to its supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Initialization finished.
    Ready,
    /// A shard connected.
    ShardReady(u32),
    /// A shard resumed its session.
    ShardResume(u32),
    /// A shard is identifying.
    ShardIdentify(u32),
    /// A shard disconnected.
    ShardDisconnect(ShardDisconnect),
    /// The child's event loop stalled; payload is a human-readable notice.
    Blocked(String),
    /// The child asks its supervisor to run a fleet-wide query.
    Request(QueryRequest),
    /// Restart one cluster, or every cluster when `None`.
    Restart(Option<u32>),
    /// Relay a payload to every worker.
    Broadcast(Value),
    /// Answer to a supervisor request.
    Response(Reply),
    /// Failed answer to a supervisor request.
    Error(ReplyError),
}

/// Messages a supervisor sends to a child process.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerMessage {
    /// Run a diagnostic query and answer with `resp`/`error`.
    Request(QueryRequest),
    /// Answer to a child's fleet-wide request.
    Response(Reply),
    /// Failed answer to a child's request.
    Error(ReplyError),
    /// Updated guild statistics.
    GuildUpdate(Value),
    /// Payload relayed from another worker.
    Broadcast(Value),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    op: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    d: Value,
}

fn payload<T: DeserializeOwned>(op: &str, d: Value) -> Result<T, IpcError> {
    serde_json::from_value(d).map_err(|source| IpcError::InvalidPayload {
        op: op.to_string(),
        source,
    })
}

/// Cluster ids arrive as numbers or numeric strings; anything else means "all".
fn restart_target(d: &Value) -> Option<u32> {
    match d {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A message type with a closed op set.
pub trait IpcMessage: Sized {
    /// Wire op name.
    fn op(&self) -> &'static str;

    /// Payload for the `d` field.
    fn payload(&self) -> Result<Value, IpcError>;

    /// Build from a decoded envelope.
    fn from_envelope(op: &str, d: Value) -> Result<Self, IpcError>;

    /// Encode as a single JSON line (without the trailing newline).
    fn encode(&self) -> Result<String, IpcError> {
        let envelope = Envelope {
            op: self.op().to_string(),
            d: self.payload()?,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decode one line. A bare JSON string is treated as an op without payload.
    fn decode(line: &str) -> Result<Self, IpcError> {
        match serde_json::from_str::<Value>(line.trim())? {
            Value::String(op) => Self::from_envelope(&op, Value::Null),
            value => {
                let envelope: Envelope = serde_json::from_value(value)?;
                Self::from_envelope(&envelope.op, envelope.d)
            }
        }
    }
}

impl IpcMessage for WorkerMessage {
    fn op(&self) -> &'static str {
        match self {
            WorkerMessage::Ready => "ready",
            WorkerMessage::ShardReady(_) => "shardReady",
            WorkerMessage::ShardResume(_) => "shardResume",
            WorkerMessage::ShardIdentify(_) => "shardIdentify",
            WorkerMessage::ShardDisconnect(_) => "shardDisconnect",
            WorkerMessage::Blocked(_) => "blocked",
            WorkerMessage::Request(_) => "request",
            WorkerMessage::Restart(_) => "restart",
            WorkerMessage::Broadcast(_) => "broadcast",
            WorkerMessage::Response(_) => "resp",
            WorkerMessage::Error(_) => "error",
        }
    }

    fn payload(&self) -> Result<Value, IpcError> {
        Ok(match self {
            WorkerMessage::Ready => Value::Null,
            WorkerMessage::ShardReady(id)
            | WorkerMessage::ShardResume(id)
            | WorkerMessage::ShardIdentify(id) => Value::from(*id),
            WorkerMessage::ShardDisconnect(d) => serde_json::to_value(d)?,
            WorkerMessage::Blocked(text) => Value::from(text.as_str()),
            WorkerMessage::Request(r) => serde_json::to_value(r)?,
            WorkerMessage::Restart(id) => id.map(Value::from).unwrap_or(Value::Null),
            WorkerMessage::Broadcast(v) => v.clone(),
            WorkerMessage::Response(r) => serde_json::to_value(r)?,
            WorkerMessage::Error(e) => serde_json::to_value(e)?,
        })
    }

    fn from_envelope(op: &str, d: Value) -> Result<Self, IpcError> {
        Ok(match op {
            "ready" => WorkerMessage::Ready,
            "shardReady" => WorkerMessage::ShardReady(payload(op, d)?),
            "shardResume" => WorkerMessage::ShardResume(payload(op, d)?),
            "shardIdentify" => WorkerMessage::ShardIdentify(payload(op, d)?),
            "shardDisconnect" => WorkerMessage::ShardDisconnect(payload(op, d)?),
            "blocked" => WorkerMessage::Blocked(payload(op, d)?),
            "request" => WorkerMessage::Request(payload(op, d)?),
            "restart" => WorkerMessage::Restart(restart_target(&d)),
            "broadcast" => WorkerMessage::Broadcast(d),
            "resp" => WorkerMessage::Response(payload(op, d)?),
            "error" => WorkerMessage::Error(payload(op, d)?),
            other => return Err(IpcError::UnknownOp(other.to_string())),
        })
    }
}

impl IpcMessage for ManagerMessage {
    fn op(&self) -> &'static str {
        match self {
            ManagerMessage::Request(_) => "request",
            ManagerMessage::Response(_) => "resp",
            ManagerMessage::Error(_) => "error",
            ManagerMessage::GuildUpdate(_) => "guildUpdate",
            ManagerMessage::Broadcast(_) => "broadcast",
        }
    }

    fn payload(&self) -> Result<Value, IpcError> {
        Ok(match self {
            ManagerMessage::Request(r) => serde_json::to_value(r)?,
            ManagerMessage::Response(r) => serde_json::to_value(r)?,
            ManagerMessage::Error(e) => serde_json::to_value(e)?,
            ManagerMessage::GuildUpdate(v) | ManagerMessage::Broadcast(v) => v.clone(),
        })
    }

    fn from_envelope(op: &str, d: Value) -> Result<Self, IpcError> {
        Ok(match op {
            "request" => ManagerMessage::Request(payload(op, d)?),
            "resp" => ManagerMessage::Response(payload(op, d)?),
            "error" => ManagerMessage::Error(payload(op, d)?),
            "guildUpdate" => ManagerMessage::GuildUpdate(d),
            "broadcast" => ManagerMessage::Broadcast(d),
            other => return Err(IpcError::UnknownOp(other.to_string())),
        })
    }
}

/// One line read from an IPC pipe.
#[derive(Debug)]
pub enum Incoming<M> {
    /// A decoded message.
    Message(M),
    /// A JSON envelope that failed to decode (unknown op, bad payload).
    Malformed {
        /// Raw line.
        line: String,
        /// Why it was rejected.
        error: IpcError,
    },
    /// A non-JSON line, usually stray output.
    Text(String),
}

/// Reads line-delimited messages.
pub struct IpcReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> IpcReader<R> {
    /// Wrap a readable pipe.
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Next non-empty line, or `None` at end of stream.
    pub async fn recv<M: IpcMessage>(&mut self) -> Result<Option<Incoming<M>>, IpcError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            let incoming = match M::decode(&line) {
                Ok(message) => Incoming::Message(message),
                Err(IpcError::Json(_)) => Incoming::Text(line),
                Err(error) => Incoming::Malformed { line, error },
            };
            return Ok(Some(incoming));
        }
    }
}

/// Writes line-delimited messages.
pub struct IpcWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> IpcWriter<W> {
    /// Wrap a writable pipe.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode, write and flush one message.
    pub async fn send<M: IpcMessage>(&mut self, message: &M) -> Result<(), IpcError> {
        let mut line = message.encode()?;
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
