// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker side of the supervisor protocol.
//!
//! A worker process reads its assignment from the environment contract set
//! by the spawner, reports shard status and readiness over stdout, answers
//! diagnostic queries arriving on stdin and serves token-authenticated RPC
//! methods on `WORKER_BASE_PORT + clusterId`.
//!
//! The process exits when stdin closes, which happens when its supervisor
//! goes away.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use shardline_protocol::{
    DiagnosticQuery, Incoming, IpcReader, IpcWriter, ManagerMessage, QueryRequest, Reply,
    ReplyError, RpcError, RpcMethods, RpcServer, WorkerMessage, handler_fn,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, ConfigError};
use crate::error::{Error, Result};
use crate::model::ShardRange;

/// Assignment handed to a worker through its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    /// Cluster id (or shard id for single-shard workers).
    pub cluster_id: u32,
    /// Shards to run.
    pub shards: ShardRange,
    /// Clusters in the fleet.
    pub cluster_count: u32,
    /// Report ready only once every shard is connected.
    pub await_ready: bool,
    /// Process record id, in the hosted topology.
    pub uuid: Option<Uuid>,
}

impl WorkerEnv {
    /// Read the contract from the process environment. `Ok(None)` when this
    /// process is not a worker.
    pub fn from_env() -> std::result::Result<Option<Self>, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the contract through `lookup`.
    ///
    /// A worker needs `id` or `shardId` plus `shardCount`. Without
    /// `firstShardId`/`lastShardId` the worker runs the single shard `id`.
    pub fn from_lookup(
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> std::result::Result<Option<Self>, ConfigError> {
        let get = |name: &'static str| lookup(name).filter(|value| !value.trim().is_empty());
        let parse = |name: &'static str| -> std::result::Result<Option<u32>, ConfigError> {
            get(name)
                .map(|value| {
                    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                        var: name,
                        value,
                    })
                })
                .transpose()
        };

        let id = match parse("id")? {
            Some(id) => Some(id),
            None => parse("shardId")?,
        };
        let (Some(id), Some(shard_count)) = (id, parse("shardCount")?) else {
            return Ok(None);
        };

        let cluster_id = parse("clusterId")?.unwrap_or(id);
        let first = parse("firstShardId")?.unwrap_or(id);
        let last = parse("lastShardId")?.unwrap_or(first);
        let shards = ShardRange::new(first, last, shard_count).map_err(|e| {
            ConfigError::InvalidValue {
                var: "lastShardId",
                value: e.to_string(),
            }
        })?;

        let uuid = get("uuid")
            .map(|value| {
                value.parse().map_err(|_| ConfigError::InvalidValue {
                    var: "uuid",
                    value,
                })
            })
            .transpose()?;

        Ok(Some(Self {
            cluster_id,
            shards,
            cluster_count: parse("clusterCount")?.unwrap_or(1),
            await_ready: get("awaitReady").is_some_and(|value| value == "true"),
            uuid,
        }))
    }
}

/// Connection state of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    /// Not connected yet.
    Disconnected,
    /// Identifying with the gateway.
    Connecting,
    /// Connected.
    Ready,
}

/// Format an uptime like `1 d, 2 h, 0 m, 5 s`, dropping leading zero units.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let units = [
        (secs / 604_800, "w"),
        (secs / 86_400 % 7, "d"),
        (secs / 3_600 % 24, "h"),
        (secs / 60 % 60, "m"),
        (secs % 60, "s"),
    ];
    let first = units
        .iter()
        .position(|(value, _)| *value > 0)
        .unwrap_or(units.len() - 1);
    units[first..]
        .iter()
        .map(|(value, unit)| format!("{} {}", value, unit))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resident set size of this process in bytes, where the platform exposes it.
fn resident_memory() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State of a running worker process.
pub struct ClusterWorker {
    env: WorkerEnv,
    started: Instant,
    started_at: DateTime<Utc>,
    shards: Mutex<BTreeMap<u32, ShardStatus>>,
    guild_stats: Mutex<Value>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
    pending: DashMap<u64, oneshot::Sender<std::result::Result<Value, String>>>,
    next_request: AtomicU64,
    ipc_timeout: Duration,
}

impl ClusterWorker {
    /// Worker for `env`. Messages for the supervisor are queued on the
    /// returned receiver.
    pub fn new(
        env: WorkerEnv,
        ipc_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (outbox, messages) = mpsc::unbounded_channel();
        let shards = env
            .shards
            .ids()
            .map(|id| (id, ShardStatus::Disconnected))
            .collect();
        let worker = Arc::new(Self {
            env,
            started: Instant::now(),
            started_at: Utc::now(),
            shards: Mutex::new(shards),
            guild_stats: Mutex::new(Value::Null),
            outbox,
            pending: DashMap::new(),
            next_request: AtomicU64::new(1),
            ipc_timeout,
        });
        (worker, messages)
    }

    /// The assignment.
    pub fn env(&self) -> &WorkerEnv {
        &self.env
    }

    fn emit(&self, message: WorkerMessage) {
        if self.outbox.send(message).is_err() {
            debug!("Supervisor channel closed");
        }
    }

    /// Status of every shard.
    pub fn shard_statuses(&self) -> BTreeMap<u32, ShardStatus> {
        lock(&self.shards).clone()
    }

    /// Bring every shard up in id order, reporting each transition.
    pub fn connect_shards(&self) {
        for id in self.env.shards.ids() {
            self.set_status(id, ShardStatus::Connecting);
            self.emit(WorkerMessage::ShardIdentify(id));
            self.set_status(id, ShardStatus::Ready);
            self.emit(WorkerMessage::ShardReady(id));
        }
    }

    fn set_status(&self, id: u32, status: ShardStatus) {
        lock(&self.shards).insert(id, status);
    }

    /// Report that initialization finished.
    pub fn report_ready(&self) {
        self.emit(WorkerMessage::Ready);
    }

    /// Latest guild statistics pushed by the supervisor.
    pub fn guild_stats(&self) -> Value {
        lock(&self.guild_stats).clone()
    }

    fn guild_count(&self) -> u64 {
        let stats = lock(&self.guild_stats);
        stats
            .get("guilds")
            .or_else(|| stats.get("guildCount"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Answer a diagnostic query about this process.
    pub fn answer(&self, query: DiagnosticQuery) -> Value {
        let uptime = self.started.elapsed();
        match query {
            DiagnosticQuery::Shards => {
                let shards = self.shard_statuses();
                let connected = shards
                    .values()
                    .filter(|status| **status == ShardStatus::Ready)
                    .count();
                json!({
                    "cluster": self.env.cluster_id,
                    "shardCount": shards.len(),
                    "connectedCount": connected,
                    "guildCount": self.guild_count(),
                    "unavailableCount": 0,
                    "voiceConnections": 0,
                    "shards": shards.keys().collect::<Vec<_>>(),
                    "uptime": format_uptime(uptime),
                    "started": self.started_at.to_rfc2822(),
                })
            }
            DiagnosticQuery::Stats => json!({
                "cluster": self.env.cluster_id,
                "pid": std::process::id(),
                "guilds": self.guild_count(),
                "shards": self.env.shards.len(),
                "mem": resident_memory(),
                "uptime": uptime.as_secs_f64(),
            }),
            DiagnosticQuery::Ping => json!({
                "cluster": self.env.cluster_id,
                "pid": std::process::id(),
            }),
        }
    }

    /// Handle one message from the supervisor.
    pub fn handle(&self, message: ManagerMessage) {
        match message {
            ManagerMessage::Request(request) => {
                let result = self.answer(request.query);
                self.emit(WorkerMessage::Response(Reply {
                    id: request.id,
                    result,
                }));
            }
            ManagerMessage::Response(reply) => {
                if let Some((_, waiter)) = self.pending.remove(&reply.id) {
                    let _ = waiter.send(Ok(reply.result));
                }
            }
            ManagerMessage::Error(reply) => {
                if let Some((_, waiter)) = self.pending.remove(&reply.id) {
                    let _ = waiter.send(Err(reply.error));
                }
            }
            ManagerMessage::GuildUpdate(stats) => {
                debug!("Guild statistics updated");
                *lock(&self.guild_stats) = stats;
            }
            ManagerMessage::Broadcast(payload) => {
                debug!(payload = %payload, "Broadcast received");
            }
        }
    }

    /// Ask the supervisor to run `query` across the fleet.
    pub async fn fleet_request(&self, query: DiagnosticQuery) -> Result<Value> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        self.emit(WorkerMessage::Request(QueryRequest { id, query }));

        let outcome = tokio::time::timeout(self.ipc_timeout, rx).await;
        self.pending.remove(&id);
        match outcome {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(Error::Other(message)),
            Ok(Err(_)) | Err(_) => Err(Error::RequestTimeout),
        }
    }

    /// RPC methods served on the worker port, all behind `token`.
    pub fn rpc_methods(self: &Arc<Self>, token: &str) -> RpcMethods {
        let shards = self.clone();
        let stats = self.clone();
        let fleet = self.clone();
        RpcMethods::new()
            .register_authenticated(
                "shards",
                token,
                handler_fn(move |_| {
                    let worker = shards.clone();
                    async move { Ok(worker.answer(DiagnosticQuery::Shards)) }
                }),
            )
            .register_authenticated(
                "stats",
                token,
                handler_fn(move |_| {
                    let worker = stats.clone();
                    async move { Ok(worker.answer(DiagnosticQuery::Stats)) }
                }),
            )
            .register_authenticated(
                "fleetShards",
                token,
                handler_fn(move |_| {
                    let worker = fleet.clone();
                    async move {
                        worker
                            .fleet_request(DiagnosticQuery::Shards)
                            .await
                            .map_err(|e| match e {
                                Error::RequestTimeout => RpcError::timeout(e),
                                other => RpcError::internal(other),
                            })
                    }
                }),
            )
    }

    /// Speak the supervisor protocol over `input`/`output` until `input`
    /// closes.
    pub async fn run<R, W>(
        self: Arc<Self>,
        messages: mpsc::UnboundedReceiver<WorkerMessage>,
        input: R,
        output: W,
        lag: LagDetector,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = tokio::spawn(write_messages(messages, IpcWriter::new(output)));
        let detector = tokio::spawn(lag.run(self.clone()));

        self.connect_shards();
        self.report_ready();
        info!(
            cluster_id = self.env.cluster_id,
            shards = %self.env.shards,
            "Worker ready"
        );

        let mut reader = IpcReader::new(input);
        let result = loop {
            match reader.recv::<ManagerMessage>().await {
                Ok(Some(Incoming::Message(message))) => self.handle(message),
                Ok(Some(Incoming::Malformed { error, .. })) => {
                    warn!(error = %error, "Malformed message from supervisor");
                }
                Ok(Some(Incoming::Text(line))) => {
                    debug!(line = %line, "Ignoring non-IPC input");
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(Error::from(e)),
            }
        };

        detector.abort();
        writer.abort();
        info!(cluster_id = self.env.cluster_id, "Supervisor channel closed, worker exiting");
        result
    }
}

async fn write_messages<W: AsyncWrite + Unpin>(
    mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
    mut writer: IpcWriter<W>,
) {
    while let Some(message) = messages.recv().await {
        if let Err(e) = writer.send(&message).await {
            warn!(error = %e, "Failed to write to supervisor");
            break;
        }
    }
}

/// Detects a stalled runtime by measuring timer overshoot.
#[derive(Debug, Clone, Copy)]
pub struct LagDetector {
    /// How often to sample.
    pub interval: Duration,
    /// Overshoot reported as blocked.
    pub threshold: Duration,
}

impl Default for LagDetector {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            threshold: Duration::from_millis(500),
        }
    }
}

impl LagDetector {
    /// Sample forever, emitting a blocked notice for every overshoot.
    async fn run(self, worker: Arc<ClusterWorker>) {
        loop {
            let started = tokio::time::Instant::now();
            tokio::time::sleep(self.interval).await;
            let lag = started.elapsed().saturating_sub(self.interval);
            if lag >= self.threshold {
                let text = format!(
                    "[C{}] Event loop blocked for {}ms",
                    worker.env.cluster_id,
                    lag.as_millis()
                );
                warn!("{}", text);
                worker.emit(WorkerMessage::Blocked(text));
            }
        }
    }
}

/// Run this process as a worker over stdin/stdout.
pub async fn run_worker(env: WorkerEnv, config: &Config) -> anyhow::Result<()> {
    info!(
        cluster_id = env.cluster_id,
        shards = %env.shards,
        await_ready = env.await_ready,
        "Starting worker"
    );

    let (worker, messages) = ClusterWorker::new(env, config.ipc_timeout);

    let port = u16::try_from(worker.env.cluster_id)
        .ok()
        .and_then(|id| config.worker_base_port.checked_add(id));
    let server = match (port, config.rpc_token.as_deref()) {
        (Some(port), Some(token)) => {
            match RpcServer::bind(&config.rpc_host, port, worker.rpc_methods(token)).await {
                Ok(server) => Some(server),
                Err(e) => {
                    warn!(port, error = %e, "Worker RPC server unavailable");
                    None
                }
            }
        }
        _ => {
            info!("RPC_TOKEN not set, worker RPC server disabled");
            None
        }
    };

    let result = worker
        .run(
            messages,
            tokio::io::stdin(),
            tokio::io::stdout(),
            LagDetector::default(),
        )
        .await;

    if let Some(server) = server {
        server.shutdown().await;
    }
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn env() -> WorkerEnv {
        WorkerEnv::from_lookup(lookup(&[
            ("id", "1"),
            ("clusterId", "1"),
            ("shardCount", "8"),
            ("firstShardId", "4"),
            ("lastShardId", "7"),
            ("clusterCount", "2"),
        ]))
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_env_contract() {
        let env = env();
        assert_eq!(env.cluster_id, 1);
        assert_eq!(env.shards, ShardRange::new(4, 7, 8).unwrap());
        assert_eq!(env.cluster_count, 2);
        assert!(!env.await_ready);
    }

    #[test]
    fn test_env_single_shard_and_absent() {
        let env = WorkerEnv::from_lookup(lookup(&[("shardId", "3"), ("shardCount", "4")]))
            .unwrap()
            .unwrap();
        assert_eq!(env.shards, ShardRange::single(3, 4).unwrap());

        assert!(WorkerEnv::from_lookup(lookup(&[("id", "3")])).unwrap().is_none());
        assert!(WorkerEnv::from_lookup(lookup(&[("id", "x"), ("shardCount", "4")])).is_err());
        assert!(
            WorkerEnv::from_lookup(lookup(&[("id", "9"), ("shardCount", "4")])).is_err()
        );
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0 s");
        assert_eq!(format_uptime(Duration::from_secs(3_725)), "1 h, 2 m, 5 s");
        assert_eq!(
            format_uptime(Duration::from_secs(8 * 86_400 + 1)),
            "1 w, 1 d, 0 h, 0 m, 1 s"
        );
    }

    #[tokio::test]
    async fn test_connect_reports_every_shard() {
        let (worker, mut messages) = ClusterWorker::new(env(), Duration::from_secs(1));
        worker.connect_shards();

        let mut ready = Vec::new();
        while let Ok(message) = messages.try_recv() {
            if let WorkerMessage::ShardReady(id) = message {
                ready.push(id);
            }
        }
        assert_eq!(ready, vec![4, 5, 6, 7]);

        let shards = worker.answer(DiagnosticQuery::Shards);
        assert_eq!(shards["connectedCount"], json!(4));
        assert_eq!(shards["shards"], json!([4, 5, 6, 7]));
    }

    #[tokio::test]
    async fn test_request_answered_with_response() {
        let (worker, mut messages) = ClusterWorker::new(env(), Duration::from_secs(1));
        worker.handle(ManagerMessage::GuildUpdate(json!({"guilds": 1200})));
        worker.handle(ManagerMessage::Request(QueryRequest {
            id: 7,
            query: DiagnosticQuery::Stats,
        }));

        match messages.recv().await {
            Some(WorkerMessage::Response(reply)) => {
                assert_eq!(reply.id, 7);
                assert_eq!(reply.result["guilds"], json!(1200));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fleet_request_resolves() {
        let (worker, mut messages) = ClusterWorker::new(env(), Duration::from_secs(5));
        let asking = worker.clone();
        let task = tokio::spawn(async move { asking.fleet_request(DiagnosticQuery::Shards).await });

        let Some(WorkerMessage::Request(request)) = messages.recv().await else {
            panic!("expected a request");
        };
        assert_eq!(request.query, DiagnosticQuery::Shards);
        worker.handle(ManagerMessage::Response(Reply {
            id: request.id,
            result: json!([{"id": 0}]),
        }));

        assert_eq!(task.await.unwrap().unwrap(), json!([{"id": 0}]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_request_times_out() {
        let (worker, _messages) = ClusterWorker::new(env(), Duration::from_secs(5));
        let err = worker
            .fleet_request(DiagnosticQuery::Ping)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout));
        assert!(worker.pending.is_empty());
    }

    #[tokio::test]
    async fn test_rpc_methods_require_token() {
        let (worker, _messages) = ClusterWorker::new(env(), Duration::from_secs(1));
        let methods = worker.rpc_methods("secret");

        let denied = methods
            .dispatch_body(br#"{"jsonrpc":"2.0","method":"stats","params":{"token":"nope"},"id":1}"#)
            .await;
        assert_eq!(denied.error, Some(RpcError::invalid_token()));

        let allowed = methods
            .dispatch_body(br#"{"jsonrpc":"2.0","method":"stats","params":{"token":"secret"},"id":2}"#)
            .await;
        assert_eq!(allowed.result.unwrap()["cluster"], json!(1));
    }

    #[tokio::test]
    async fn test_run_until_input_closes() {
        let (worker, messages) = ClusterWorker::new(env(), Duration::from_secs(1));
        let (input, mut supervisor_in) = tokio::io::duplex(4096);
        let (supervisor_out, output) = tokio::io::duplex(4096);

        let task = tokio::spawn(worker.run(messages, input, output, LagDetector::default()));

        let mut reader = IpcReader::new(supervisor_out);
        let mut saw_ready = false;
        while let Some(Incoming::Message(message)) = reader.recv::<WorkerMessage>().await.unwrap() {
            if message == WorkerMessage::Ready {
                saw_ready = true;
                break;
            }
        }
        assert!(saw_ready);

        let mut writer = IpcWriter::new(&mut supervisor_in);
        writer
            .send(&ManagerMessage::Request(QueryRequest {
                id: 1,
                query: DiagnosticQuery::Ping,
            }))
            .await
            .unwrap();
        match reader.recv::<WorkerMessage>().await.unwrap() {
            Some(Incoming::Message(WorkerMessage::Response(reply))) => assert_eq!(reply.id, 1),
            other => panic!("unexpected {:?}", other),
        }

        drop(supervisor_in);
        task.await.unwrap().unwrap();
    }
}
