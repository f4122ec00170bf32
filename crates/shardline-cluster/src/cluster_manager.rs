// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster manager of the hosted topology.
//!
//! Runs as a child of the host's process manager. It owns the clusters the
//! store assigns to its host state, asks the process manager to run them,
//! and turns relayed lifecycle events and shard notices into status posts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use shardline_protocol::{
    IpcReader, IpcWriter, ManagerMessage, RpcClient, RpcError, RpcMethods, RpcServer,
    WorkerMessage, handler_fn,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fan_in::{EmbedField, FanInConfig, LogFanIn, StatusSink, WorkerNotice, sink_for};
use crate::model::{ClusterSpec, HostRef, ProcessRecord};
use crate::restart_queue::{RestartQueue, Restartable};
use crate::store::{ClusterStore, PostgresClusterStore};

/// The process manager of this host, as seen by the cluster manager.
#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Processes the host is running.
    async fn list(&self) -> Result<Vec<ProcessRecord>>;

    /// Start a cluster process.
    async fn create(&self, spec: &ClusterSpec) -> Result<ProcessRecord>;

    /// Stop and forget a process.
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Restart a process and wait for it to be ready.
    async fn restart(&self, id: Uuid) -> Result<ProcessRecord>;
}

#[async_trait]
impl ProcessHost for RpcClient {
    async fn list(&self) -> Result<Vec<ProcessRecord>> {
        Ok(self.call("list", &json!({})).await?)
    }

    async fn create(&self, spec: &ClusterSpec) -> Result<ProcessRecord> {
        Ok(self.call("create", &json!({ "cluster": spec })).await?)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.request("delete", json!({ "id": id })).await?;
        Ok(())
    }

    async fn restart(&self, id: Uuid) -> Result<ProcessRecord> {
        Ok(self.call("restart", &json!({ "id": id })).await?)
    }
}

/// Cluster managers of other hosts.
#[async_trait]
pub trait PeerManagers: Send + Sync {
    /// Ask the manager on `host` to start cluster `id`.
    async fn create_cluster(&self, host: &HostRef, id: u32) -> Result<()>;
}

/// Reaches peers over RPC on their manager port.
pub struct RpcPeerManagers {
    port: u16,
}

impl RpcPeerManagers {
    /// Peers listening on `port`.
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl PeerManagers for RpcPeerManagers {
    async fn create_cluster(&self, host: &HostRef, id: u32) -> Result<()> {
        RpcClient::new(host.hostname.clone(), self.port)
            .request("createCluster", json!({ "id": id }))
            .await?;
        Ok(())
    }
}

/// A remote cluster process, restartable through the queue.
struct RemoteProcess {
    host: Arc<dyn ProcessHost>,
    cluster_id: u32,
    id: Uuid,
}

#[async_trait]
impl Restartable for RemoteProcess {
    fn label(&self) -> String {
        format!("cluster {}", self.cluster_id)
    }

    async fn restart(&self) -> Result<()> {
        self.host.restart(self.id).await.map(|_| ())
    }
}

/// Target of a `restart` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTarget {
    /// Every process, one at a time.
    All,
    /// One cluster.
    Cluster(u32),
}

impl RestartTarget {
    /// Parse `"all"`, a number or a numeric string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if s == "all" => Some(RestartTarget::All),
            Value::String(s) => s.parse().ok().map(RestartTarget::Cluster),
            Value::Number(n) => n
                .as_u64()
                .and_then(|id| u32::try_from(id).ok())
                .map(RestartTarget::Cluster),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProcessExit {
    process: ProcessRecord,
    code: Option<i32>,
    signal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessReady {
    process: ProcessRecord,
}

#[derive(Debug, Deserialize)]
struct ShardEvent {
    id: u32,
    cluster: Option<u32>,
    #[serde(default)]
    err: Option<String>,
}

#[derive(Debug, Default)]
struct Fleet {
    clusters: BTreeMap<u32, ClusterSpec>,
    processes: BTreeMap<u32, ProcessRecord>,
}

/// Timing and identity of a cluster manager.
#[derive(Debug, Clone)]
pub struct ClusterManagerConfig {
    /// Host state whose clusters this manager owns.
    pub state: i32,
    /// Pause between creating clusters on a fresh start.
    pub cluster_start_delay: Duration,
}

impl From<&Config> for ClusterManagerConfig {
    fn from(config: &Config) -> Self {
        Self {
            state: config.state,
            cluster_start_delay: config.cluster_start_delay,
        }
    }
}

/// Owns the clusters of one host state.
pub struct ClusterManager {
    config: ClusterManagerConfig,
    store: Arc<dyn ClusterStore>,
    host: Arc<dyn ProcessHost>,
    peers: Arc<dyn PeerManagers>,
    fan_in: Arc<LogFanIn>,
    sink: Arc<dyn StatusSink>,
    fleet: Mutex<Fleet>,
    queue: RestartQueue<RemoteProcess>,
}

impl ClusterManager {
    /// Manager over `store` and the local process `host`. Must be called
    /// inside a tokio runtime.
    pub fn new(
        config: ClusterManagerConfig,
        store: Arc<dyn ClusterStore>,
        host: Arc<dyn ProcessHost>,
        peers: Arc<dyn PeerManagers>,
        fan_in: Arc<LogFanIn>,
        sink: Arc<dyn StatusSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            host,
            peers,
            fan_in,
            sink,
            fleet: Mutex::new(Fleet::default()),
            queue: RestartQueue::new(),
        })
    }

    fn fleet(&self) -> MutexGuard<'_, Fleet> {
        self.fleet.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clusters currently known, in id order.
    pub fn clusters(&self) -> Vec<ClusterSpec> {
        self.fleet().clusters.values().cloned().collect()
    }

    /// Processes currently known, in cluster order.
    pub fn processes(&self) -> Vec<ProcessRecord> {
        self.fleet().processes.values().cloned().collect()
    }

    /// Load this state's clusters from the store.
    pub async fn load(&self) -> Result<usize> {
        let clusters = self.store.find_clusters(self.config.state).await?;
        let count = clusters.len();
        self.fleet().clusters = clusters.into_iter().map(|spec| (spec.id, spec)).collect();
        info!(state = self.config.state, clusters = count, "Clusters loaded");
        Ok(count)
    }

    /// Adopt the processes the host already runs, or create one per cluster
    /// when it runs none.
    pub async fn start(&self) -> Result<()> {
        let running = self.host.list().await?;
        if !running.is_empty() {
            info!(processes = running.len(), "Resuming with running processes");
            let mut fleet = self.fleet();
            for record in running {
                if let Some(id) = record.cluster().map(|spec| spec.id) {
                    fleet.processes.insert(id, record);
                }
            }
            return Ok(());
        }

        let clusters = self.clusters();
        for (index, spec) in clusters.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.cluster_start_delay).await;
            }
            match self.host.create(spec).await {
                Ok(record) => {
                    info!(cluster_id = spec.id, process = %record.id, "Cluster created");
                    self.fleet().processes.insert(spec.id, record);
                }
                Err(e) => warn!(cluster_id = spec.id, error = %e, "Failed to create cluster"),
            }
        }
        Ok(())
    }

    /// Start cluster `id` on this host, reading it from the store when it
    /// is not loaded yet.
    pub async fn create_cluster(&self, id: u32) -> Result<ProcessRecord> {
        let known = self.fleet().clusters.get(&id).cloned();
        let spec = match known {
            Some(spec) => spec,
            None => {
                let spec = self
                    .store
                    .find_cluster(self.config.state, id)
                    .await?
                    .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
                self.fleet().clusters.insert(id, spec.clone());
                spec
            }
        };

        let record = self.host.create(&spec).await?;
        info!(cluster_id = id, process = %record.id, "Cluster created");
        self.fleet().processes.insert(id, record.clone());
        Ok(record)
    }

    /// Reassign cluster `id` to the host called `name` and hand it over.
    pub async fn move_cluster(&self, id: u32, name: &str) -> Result<()> {
        let target = self
            .store
            .find_host(name)
            .await?
            .ok_or_else(|| Error::InvalidRecord(format!("unknown host {}", name)))?
            .host_ref();

        if !self
            .store
            .update_cluster_host(self.config.state, id, &target)
            .await?
        {
            return Err(Error::ClusterNotFound(id.to_string()));
        }

        self.peers.create_cluster(&target, id).await?;

        let local = {
            let mut fleet = self.fleet();
            fleet.clusters.remove(&id);
            fleet.processes.remove(&id)
        };
        if let Some(record) = local {
            self.host.delete(record.id).await?;
        }
        info!(cluster_id = id, host = %target.name, "Cluster moved");
        Ok(())
    }

    fn remote(&self, record: &ProcessRecord) -> Option<RemoteProcess> {
        record.cluster().map(|spec| RemoteProcess {
            host: self.host.clone(),
            cluster_id: spec.id,
            id: record.id,
        })
    }

    /// Restart one cluster and wait for it.
    pub async fn restart_cluster(&self, id: u32) -> Result<ProcessRecord> {
        let process = self
            .fleet()
            .processes
            .get(&id)
            .map(|record| record.id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
        let record = self.host.restart(process).await?;
        self.fleet().processes.insert(id, record.clone());
        Ok(record)
    }

    /// Restart every process through the queue, in cluster order.
    pub async fn restart_all(&self) -> Vec<(String, Result<()>)> {
        let items: Vec<RemoteProcess> = self
            .processes()
            .iter()
            .filter_map(|record| self.remote(record))
            .collect();
        info!(processes = items.len(), "Restarting all clusters");
        self.queue.restart_all(items).await
    }

    async fn post(&self, title: &str, fields: &[EmbedField]) {
        if let Err(e) = self.sink.post(title, None, fields).await {
            warn!(error = %e, "Failed to post cluster notice");
        }
    }

    async fn process_exit(&self, event: ProcessExit) {
        let Some(spec) = event.process.cluster() else {
            return;
        };
        let reason = match (event.code, &event.signal) {
            (Some(code), _) => code.to_string(),
            (None, Some(signal)) => signal.clone(),
            (None, None) => "unknown".to_string(),
        };
        warn!(cluster_id = spec.id, reason = %reason, "Cluster process died");
        let title = format!("Cluster {} died with code {}, restarting...", spec.id, reason);
        self.post(&title, &[EmbedField::new("Shards", spec.shards.to_string())])
            .await;
    }

    async fn process_ready(&self, event: ProcessReady) {
        let Some(id) = event.process.cluster().map(|spec| spec.id) else {
            return;
        };
        self.fleet().processes.insert(id, event.process);
        self.post(&format!("Cluster {} ready.", id), &[]).await;
    }

    /// RPC method table. `token` guards `moveCluster` and `restart`.
    pub fn rpc_methods(self: &Arc<Self>, token: &str) -> RpcMethods {
        let blocked = self.clone();
        let exit = self.clone();
        let ready = self.clone();
        let create = self.clone();
        let move_to = self.clone();
        let disconnect = self.clone();
        let shard_ready = self.clone();
        let resume = self.clone();
        let restart = self.clone();

        RpcMethods::new()
            .register(
                "blocked",
                handler_fn(move |params| {
                    let manager = blocked.clone();
                    async move {
                        let text = params
                            .get("text")
                            .and_then(Value::as_str)
                            .ok_or_else(|| RpcError::invalid_params("Missing text"))?;
                        manager.fan_in.push_blocked(text.to_string());
                        Ok(json!("OK"))
                    }
                }),
            )
            .register(
                "processExit",
                handler_fn(move |params| {
                    let manager = exit.clone();
                    async move {
                        let event = serde_json::from_value(params).map_err(RpcError::invalid_params)?;
                        manager.process_exit(event).await;
                        Ok(json!("OK"))
                    }
                }),
            )
            .register(
                "processReady",
                handler_fn(move |params| {
                    let manager = ready.clone();
                    async move {
                        let event = serde_json::from_value(params).map_err(RpcError::invalid_params)?;
                        manager.process_ready(event).await;
                        Ok(json!("OK"))
                    }
                }),
            )
            .register(
                "createCluster",
                handler_fn(move |params| {
                    let manager = create.clone();
                    async move {
                        let id = cluster_param(&params)?;
                        let record = manager.create_cluster(id).await.map_err(|e| match e {
                            Error::ClusterNotFound(_) => {
                                RpcError::not_found(format!("Unable to find cluster {}", id))
                            }
                            other => RpcError::internal(other),
                        })?;
                        serde_json::to_value(record).map_err(RpcError::internal)
                    }
                }),
            )
            .register_authenticated(
                "moveCluster",
                token,
                handler_fn(move |params| {
                    let manager = move_to.clone();
                    async move {
                        let id = cluster_param(&params)?;
                        let name = params
                            .get("name")
                            .and_then(Value::as_str)
                            .filter(|name| !name.is_empty())
                            .ok_or_else(|| RpcError::invalid_params("Invalid host."))?;
                        manager.move_cluster(id, name).await.map_err(|e| match e {
                            Error::InvalidRecord(_) => RpcError::invalid_params("Invalid host."),
                            Error::ClusterNotFound(_) => {
                                RpcError::not_found(format!("Unable to find cluster {}", id))
                            }
                            other => RpcError::internal(other),
                        })?;
                        Ok(json!("OK"))
                    }
                }),
            )
            .register(
                "shardDisconnect",
                handler_fn(move |params| {
                    let manager = disconnect.clone();
                    async move {
                        let event = shard_event(params)?;
                        manager.fan_in.record(&WorkerNotice::ShardDisconnect {
                            cluster: event.cluster,
                            shard: event.id,
                            err: event.err,
                        });
                        Ok(json!("OK"))
                    }
                }),
            )
            .register(
                "shardReady",
                handler_fn(move |params| {
                    let manager = shard_ready.clone();
                    async move {
                        let event = shard_event(params)?;
                        manager.fan_in.record(&WorkerNotice::ShardReady {
                            cluster: event.cluster,
                            shard: event.id,
                        });
                        Ok(json!("OK"))
                    }
                }),
            )
            .register(
                "shardResume",
                handler_fn(move |params| {
                    let manager = resume.clone();
                    async move {
                        let event = shard_event(params)?;
                        manager.fan_in.record(&WorkerNotice::ShardResume {
                            cluster: event.cluster,
                            shard: event.id,
                        });
                        Ok(json!("OK"))
                    }
                }),
            )
            .register_authenticated(
                "restart",
                token,
                handler_fn(move |params| {
                    let manager = restart.clone();
                    async move {
                        let raw = params.get("id").cloned().unwrap_or(Value::Null);
                        match RestartTarget::from_value(&raw) {
                            Some(RestartTarget::All) => {
                                tokio::spawn(async move {
                                    for (label, result) in manager.restart_all().await {
                                        if let Err(e) = result {
                                            warn!(worker = %label, error = %e, "Restart failed");
                                        }
                                    }
                                });
                                Ok(json!("OK"))
                            }
                            Some(RestartTarget::Cluster(id)) => {
                                let record = manager.restart_cluster(id).await.map_err(|e| match e {
                                    Error::ClusterNotFound(_) => {
                                        RpcError::not_found(format!("Unable to find cluster {}", id))
                                    }
                                    other => RpcError::internal(other),
                                })?;
                                serde_json::to_value(record).map_err(RpcError::internal)
                            }
                            None => Err(RpcError::not_found(format!(
                                "Unable to find cluster {}",
                                display_id(&raw)
                            ))),
                        }
                    }
                }),
            )
    }
}

fn display_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn cluster_param(params: &Value) -> std::result::Result<u32, RpcError> {
    match params.get("id").and_then(RestartTarget::from_value) {
        Some(RestartTarget::Cluster(id)) => Ok(id),
        _ => Err(RpcError::invalid_params("Missing ID")),
    }
}

fn shard_event(params: Value) -> std::result::Result<ShardEvent, RpcError> {
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

/// Run the cluster manager role until its parent closes stdin or ctrl-c.
pub async fn run_cluster_manager(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn ClusterStore> =
        Arc::new(PostgresClusterStore::connect(config.require_database_url()?).await?);
    let host: Arc<dyn ProcessHost> = Arc::new(RpcClient::new(
        config.rpc_host.clone(),
        config.process_manager_port,
    ));
    let peers: Arc<dyn PeerManagers> = Arc::new(RpcPeerManagers::new(config.manager_rpc_port));

    let fan_in = Arc::new(LogFanIn::new(
        sink_for(
            config.shard_webhook_url.as_deref(),
            "Shard Manager",
            config.state_name.clone(),
        ),
        FanInConfig {
            blocked_interval: config.blocked_flush_interval,
            status_interval: config.status_flush_interval,
            ..FanInConfig::default()
        },
    ));
    let sink = sink_for(
        config.cluster_webhook_url.as_deref(),
        "Cluster Manager",
        config.state_name.clone(),
    );

    let manager = ClusterManager::new(
        ClusterManagerConfig::from(&config),
        store,
        host,
        peers,
        fan_in.clone(),
        sink,
    );
    manager.load().await?;

    let token = config.rpc_token.clone().unwrap_or_default();
    if token.is_empty() {
        warn!("RPC_TOKEN is not set, moveCluster and restart will reject every call");
    }
    let server = RpcServer::bind(
        &config.rpc_host,
        config.manager_rpc_port,
        manager.rpc_methods(&token),
    )
    .await?;
    info!(addr = %server.local_addr(), state = config.state, "Cluster manager listening");

    let flusher = {
        let fan_in = fan_in.clone();
        tokio::spawn(async move { fan_in.run().await })
    };

    IpcWriter::new(tokio::io::stdout())
        .send(&WorkerMessage::Ready)
        .await?;
    manager.start().await?;

    let mut parent = IpcReader::new(tokio::io::stdin());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping cluster manager");
        }
        _ = async {
            loop {
                match parent.recv::<ManagerMessage>().await {
                    Ok(Some(message)) => debug!(?message, "Ignoring message from process manager"),
                    Ok(None) | Err(_) => break,
                }
            }
        } => {
            info!("Process manager closed the channel, stopping cluster manager");
        }
    }

    fan_in.shutdown_handle().notify_one();
    let _ = flusher.await;
    server.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::model::{PortMap, ShardRange, WorkerRole};
    use crate::store::{HostRecord, MemoryClusterStore};

    #[derive(Default)]
    struct FakeHost {
        records: Mutex<Vec<ProcessRecord>>,
        deleted: Mutex<Vec<Uuid>>,
        restarted: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl ProcessHost for FakeHost {
        async fn list(&self) -> Result<Vec<ProcessRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }

        async fn create(&self, spec: &ClusterSpec) -> Result<ProcessRecord> {
            let role = WorkerRole::Cluster(spec.clone());
            let record = ProcessRecord {
                id: Uuid::new_v4(),
                pid: Some(100 + spec.id),
                port: role.port(PortMap::default()),
                options: role,
                created_at: Utc::now(),
            };
            self.records.lock().unwrap().push(record.clone());
            Ok(record)
        }

        async fn delete(&self, id: Uuid) -> Result<()> {
            self.deleted.lock().unwrap().push(id);
            Ok(())
        }

        async fn restart(&self, id: Uuid) -> Result<ProcessRecord> {
            self.restarted.lock().unwrap().push(id);
            self.records
                .lock()
                .unwrap()
                .iter()
                .find(|record| record.id == id)
                .cloned()
                .ok_or_else(|| Error::ClusterNotFound(id.to_string()))
        }
    }

    #[derive(Default)]
    struct FakePeers {
        created: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl PeerManagers for FakePeers {
        async fn create_cluster(&self, host: &HostRef, id: u32) -> Result<()> {
            self.created.lock().unwrap().push((host.name.clone(), id));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        titles: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn post(&self, title: &str, _text: Option<&str>, _fields: &[EmbedField]) -> Result<()> {
            self.titles.lock().unwrap().push(title.to_string());
            Ok(())
        }
    }

    struct Fixture {
        manager: Arc<ClusterManager>,
        host: Arc<FakeHost>,
        peers: Arc<FakePeers>,
        sink: Arc<RecordingSink>,
        fan_in: Arc<LogFanIn>,
    }

    fn host_record(name: &str, state: i32) -> HostRecord {
        HostRecord {
            name: name.to_string(),
            hostname: format!("{}.lan", name),
            state,
            client_id: Some("app".to_string()),
            position: state,
        }
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryClusterStore::new());
        let titan = host_record("titan", 1);
        store.upsert_host(&titan).await.unwrap();
        store.upsert_host(&host_record("atlas", 2)).await.unwrap();
        let specs: Vec<ClusterSpec> = (0..3)
            .map(|id| {
                let mut spec =
                    ClusterSpec::new(id, ShardRange::new(id * 2, id * 2 + 1, 6).unwrap(), 3);
                spec.host = Some(titan.host_ref());
                spec
            })
            .collect();
        store.insert_clusters(&specs).await.unwrap();

        let host = Arc::new(FakeHost::default());
        let peers = Arc::new(FakePeers::default());
        let sink = Arc::new(RecordingSink::default());
        let fan_in = Arc::new(LogFanIn::new(sink.clone(), FanInConfig::default()));
        let manager = ClusterManager::new(
            ClusterManagerConfig {
                state: 1,
                cluster_start_delay: Duration::from_millis(1),
            },
            store,
            host.clone(),
            peers.clone(),
            fan_in.clone(),
            sink.clone(),
        );
        manager.load().await.unwrap();
        Fixture {
            manager,
            host,
            peers,
            sink,
            fan_in,
        }
    }

    async fn call(methods: &RpcMethods, method: &str, params: Value) -> std::result::Result<Value, RpcError> {
        let body = json!({"method": method, "params": params, "id": 1}).to_string();
        methods.dispatch_body(body.as_bytes()).await.into_result()
    }

    #[tokio::test]
    async fn test_fresh_start_creates_every_cluster_in_order() {
        let f = fixture().await;
        f.manager.start().await.unwrap();

        let created: Vec<u32> = f
            .host
            .records
            .lock()
            .unwrap()
            .iter()
            .filter_map(|record| record.cluster().map(|spec| spec.id))
            .collect();
        assert_eq!(created, vec![0, 1, 2]);
        assert_eq!(f.manager.processes().len(), 3);
    }

    #[tokio::test]
    async fn test_start_resumes_running_processes() {
        let f = fixture().await;
        let spec = f.manager.clusters()[1].clone();
        f.host.create(&spec).await.unwrap();

        f.manager.start().await.unwrap();

        assert_eq!(f.host.records.lock().unwrap().len(), 1);
        let known: Vec<u32> = f
            .manager
            .processes()
            .iter()
            .filter_map(|record| record.cluster().map(|spec| spec.id))
            .collect();
        assert_eq!(known, vec![1]);
    }

    #[tokio::test]
    async fn test_move_cluster() {
        let f = fixture().await;
        f.manager.start().await.unwrap();
        let local = f.manager.processes()[2].id;
        let methods = f.manager.rpc_methods("secret");

        let denied = call(&methods, "moveCluster", json!({"id": 2, "name": "atlas"})).await;
        assert_eq!(denied.unwrap_err(), RpcError::invalid_token());

        let invalid = call(
            &methods,
            "moveCluster",
            json!({"id": 2, "name": "nowhere", "token": "secret"}),
        )
        .await;
        assert_eq!(invalid.unwrap_err().message, "Invalid host.");

        let moved = call(
            &methods,
            "moveCluster",
            json!({"id": 2, "name": "atlas", "token": "secret"}),
        )
        .await;
        assert_eq!(moved.unwrap(), json!("OK"));
        assert_eq!(*f.peers.created.lock().unwrap(), vec![("atlas".to_string(), 2)]);
        assert_eq!(*f.host.deleted.lock().unwrap(), vec![local]);
        assert_eq!(f.manager.clusters().len(), 2);
    }

    #[tokio::test]
    async fn test_restart_rpc() {
        let f = fixture().await;
        f.manager.start().await.unwrap();
        let methods = f.manager.rpc_methods("secret");

        let unknown = call(&methods, "restart", json!({"id": 9, "token": "secret"})).await;
        assert_eq!(unknown.unwrap_err().message, "Unable to find cluster 9");

        let one = call(&methods, "restart", json!({"id": "1", "token": "secret"})).await;
        assert!(one.is_ok());
        assert_eq!(f.host.restarted.lock().unwrap().len(), 1);

        let results = f.manager.restart_all().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(f.host.restarted.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_create_cluster_falls_back_to_store() {
        let f = fixture().await;
        let methods = f.manager.rpc_methods("secret");

        let created = call(&methods, "createCluster", json!({"id": 1})).await.unwrap();
        assert_eq!(created["options"]["cluster"]["id"], json!(1));

        let missing = call(&methods, "createCluster", json!({"id": 7})).await;
        assert_eq!(missing.unwrap_err().message, "Unable to find cluster 7");
    }

    #[tokio::test]
    async fn test_lifecycle_and_shard_notices() {
        let f = fixture().await;
        f.manager.start().await.unwrap();
        let process = f.manager.processes()[0].clone();
        let methods = f.manager.rpc_methods("secret");

        call(
            &methods,
            "processExit",
            json!({"process": process, "code": 1, "signal": null}),
        )
        .await
        .unwrap();
        call(&methods, "processReady", json!({"process": process}))
            .await
            .unwrap();
        call(&methods, "shardReady", json!({"id": 0, "cluster": 0}))
            .await
            .unwrap();
        call(&methods, "blocked", json!({"text": "[C0] Event loop blocked for 900ms"}))
            .await
            .unwrap();

        assert_eq!(
            *f.sink.titles.lock().unwrap(),
            vec![
                "Cluster 0 died with code 1, restarting...".to_string(),
                "Cluster 0 ready.".to_string(),
            ]
        );
        assert_eq!(f.fan_in.buffered(), (1, 1));
    }
}
