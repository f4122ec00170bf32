// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-host process manager of the hosted topology.
//!
//! Spawns the cluster manager and, on its request, cluster processes. Every
//! process is supervised; lifecycle events and worker notices are relayed to
//! the cluster manager over RPC.
//!
//! RPC methods (port 5050 by default):
//!
//! | Method | Params | Result |
//! |--------|--------|--------|
//! | `create` | `{cluster}` | process record |
//! | `delete` | `{id}` | `"OK"` |
//! | `list` | `{}` | cluster process records |
//! | `restart` | `{id}` | process record once the replacement is ready |
//! | `restartManager` | `{}` | `"OK"` |

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use shardline_protocol::{RpcClient, RpcError, RpcMethods, RpcServer, handler_fn};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fan_in::WorkerNotice;
use crate::log_stream::{LogStreamHub, LogStreamServer};
use crate::model::{ClusterSpec, PortMap, ProcessRecord, WorkerId, WorkerRole};
use crate::runner::{ExitInfo, NativeSpawner, ProcessSpawner};
use crate::supervisor::{LifecycleObserver, Supervisor, SupervisorConfig};
use crate::worker::WorkerHandle;

/// Receives what the process manager relays.
#[async_trait]
pub trait ManagerLink: Send + Sync {
    /// Deliver one notification. Delivery is best effort.
    async fn notify(&self, method: &str, params: Value);
}

#[async_trait]
impl ManagerLink for RpcClient {
    async fn notify(&self, method: &str, params: Value) {
        RpcClient::notify(self, method, params);
    }
}

/// Relays lifecycle events and notices of cluster processes.
pub struct RelayObserver {
    link: Arc<dyn ManagerLink>,
    ports: PortMap,
}

impl RelayObserver {
    /// Relay through `link`.
    pub fn new(link: Arc<dyn ManagerLink>, ports: PortMap) -> Self {
        Self { link, ports }
    }

    fn record(&self, handle: &WorkerHandle) -> Option<ProcessRecord> {
        handle
            .role()
            .cluster()
            .and_then(|_| handle.record(self.ports))
    }
}

#[async_trait]
impl LifecycleObserver for RelayObserver {
    async fn unexpected_exit(&self, handle: &WorkerHandle, exit: ExitInfo) {
        let Some(process) = self.record(handle) else {
            warn!(exit = %exit, "Cluster manager died, restarting");
            return;
        };
        self.link
            .notify(
                "processExit",
                json!({ "process": process, "code": exit.code, "signal": exit.signal_name() }),
            )
            .await;
    }

    async fn recovered(&self, handle: &WorkerHandle, _pid: u32) {
        if let Some(process) = self.record(handle) {
            self.link
                .notify("processReady", json!({ "process": process }))
                .await;
        }
    }

    async fn notice(&self, _handle: &WorkerHandle, notice: WorkerNotice) {
        let (method, params) = match notice {
            WorkerNotice::Blocked(text) => ("blocked", json!({ "text": text })),
            WorkerNotice::ShardReady { cluster, shard } => {
                ("shardReady", json!({ "id": shard, "cluster": cluster }))
            }
            WorkerNotice::ShardResume { cluster, shard } => {
                ("shardResume", json!({ "id": shard, "cluster": cluster }))
            }
            WorkerNotice::ShardDisconnect {
                cluster,
                shard,
                err,
            } => (
                "shardDisconnect",
                json!({ "id": shard, "cluster": cluster, "err": err }),
            ),
            WorkerNotice::ShardIdentify { cluster, shard } => {
                debug!(?cluster, shard, "Shard identifying");
                return;
            }
        };
        self.link.notify(method, params).await;
    }
}

/// Spawns and tracks the processes of one host.
pub struct ProcessManager {
    supervisor: Arc<Supervisor>,
    ports: PortMap,
    manager: WorkerId,
}

impl ProcessManager {
    /// Process manager spawning through `supervisor`.
    pub fn new(supervisor: Arc<Supervisor>, ports: PortMap) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            ports,
            manager: WorkerId::Process(Uuid::new_v4()),
        })
    }

    /// The supervisor.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    fn manager_uuid(&self) -> Option<Uuid> {
        match self.manager {
            WorkerId::Process(uuid) => Some(uuid),
            WorkerId::Cluster(_) => None,
        }
    }

    /// Spawn the cluster manager process.
    pub async fn start_manager(&self) -> Result<()> {
        let handle = self
            .supervisor
            .spawn(self.manager, WorkerRole::Manager, self.manager_uuid(), false)
            .await?;
        info!(pid = ?handle.pid(), "Cluster manager spawned");
        Ok(())
    }

    /// Spawn a cluster process without waiting for it to become ready.
    pub async fn create(&self, spec: ClusterSpec) -> Result<ProcessRecord> {
        let uuid = Uuid::new_v4();
        let cluster_id = spec.id;
        let handle = self
            .supervisor
            .spawn(WorkerId::Process(uuid), WorkerRole::Cluster(spec), Some(uuid), false)
            .await?;
        info!(cluster_id, process = %uuid, pid = ?handle.pid(), "Cluster process created");
        self.record_of(&handle)
    }

    fn record_of(&self, handle: &WorkerHandle) -> Result<ProcessRecord> {
        handle
            .record(self.ports)
            .ok_or_else(|| Error::InvalidRecord(format!("worker {} has no process id", handle.id())))
    }

    /// SIGTERM a cluster process and forget it.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let worker = WorkerId::Process(id);
        if worker == self.manager {
            return Err(Error::ClusterNotFound(id.to_string()));
        }
        self.supervisor.delete(&worker)?;
        Ok(())
    }

    /// Records of every cluster process.
    pub fn list(&self) -> Vec<ProcessRecord> {
        self.supervisor
            .registry()
            .handles()
            .iter()
            .filter(|handle| handle.id() != self.manager)
            .filter_map(|handle| handle.record(self.ports))
            .collect()
    }

    /// Restart a cluster process and wait for the replacement to be ready.
    pub async fn restart(&self, id: Uuid) -> Result<ProcessRecord> {
        let worker = WorkerId::Process(id);
        let handle = self
            .supervisor
            .registry()
            .get(&worker)
            .filter(|_| worker != self.manager)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
        handle.restart(true).await?;
        self.record_of(&handle)
    }

    /// Restart the cluster manager in the background.
    pub fn restart_manager(&self) -> Result<()> {
        let handle = self
            .supervisor
            .registry()
            .get(&self.manager)
            .ok_or_else(|| Error::ClusterNotFound("cluster manager".to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = handle.restart(false).await {
                error!(error = %e, "Cluster manager restart failed");
            }
        });
        Ok(())
    }

    /// RPC method table.
    pub fn rpc_methods(self: &Arc<Self>) -> RpcMethods {
        let create = self.clone();
        let delete = self.clone();
        let list = self.clone();
        let restart = self.clone();
        let restart_manager = self.clone();

        RpcMethods::new()
            .register(
                "create",
                handler_fn(move |params| {
                    let manager = create.clone();
                    async move {
                        let cluster = params
                            .get("cluster")
                            .cloned()
                            .ok_or_else(|| RpcError::invalid_params("Missing cluster"))?;
                        let spec: ClusterSpec =
                            serde_json::from_value(cluster).map_err(RpcError::invalid_params)?;
                        let record = manager.create(spec).await.map_err(RpcError::internal)?;
                        serde_json::to_value(record).map_err(RpcError::internal)
                    }
                }),
            )
            .register(
                "delete",
                handler_fn(move |params| {
                    let manager = delete.clone();
                    async move {
                        let id = process_id(&params)?;
                        manager
                            .delete(id)
                            .map_err(|_| RpcError::not_found(format!("Process {} not found.", id)))?;
                        Ok(json!("OK"))
                    }
                }),
            )
            .register(
                "list",
                handler_fn(move |_| {
                    let manager = list.clone();
                    async move { serde_json::to_value(manager.list()).map_err(RpcError::internal) }
                }),
            )
            .register(
                "restart",
                handler_fn(move |params| {
                    let manager = restart.clone();
                    async move {
                        let id = process_id(&params)?;
                        let record = manager.restart(id).await.map_err(|e| match e {
                            Error::ClusterNotFound(_) => {
                                RpcError::not_found(format!("Process {} not found.", id))
                            }
                            other => RpcError::internal(other),
                        })?;
                        serde_json::to_value(record).map_err(RpcError::internal)
                    }
                }),
            )
            .register(
                "restartManager",
                handler_fn(move |_| {
                    let manager = restart_manager.clone();
                    async move {
                        manager.restart_manager().map_err(RpcError::internal)?;
                        Ok(json!("OK"))
                    }
                }),
            )
    }
}

/// `params.id` as a process uuid.
fn process_id(params: &Value) -> std::result::Result<Uuid, RpcError> {
    let id = params
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| RpcError::invalid_params("Missing ID"))?;
    id.parse()
        .map_err(|_| RpcError::not_found(format!("Process {} not found.", id)))
}

/// Run the process manager of this host until ctrl-c.
pub async fn run_process_manager(config: Config) -> anyhow::Result<()> {
    let ports = PortMap {
        worker_base: config.worker_base_port,
        manager: config.manager_rpc_port,
    };

    let hub = LogStreamHub::new();
    let log_server = LogStreamServer::bind(&config.rpc_host, config.log_server_port, hub.clone()).await?;

    let spawner: Arc<dyn ProcessSpawner> = Arc::new(worker_spawner(&config)?.output(Arc::new(hub)));
    let link: Arc<dyn ManagerLink> = Arc::new(RpcClient::new(&config.rpc_host, config.manager_rpc_port));
    let observer = Arc::new(RelayObserver::new(link, ports));
    let supervisor = Supervisor::new(spawner, SupervisorConfig::from(&config), observer);
    let supervisor_task = tokio::spawn(supervisor.clone().run());

    let manager = ProcessManager::new(supervisor.clone(), ports);
    let server = RpcServer::bind(
        &config.rpc_host,
        config.process_manager_port,
        manager.rpc_methods(),
    )
    .await?;
    manager.start_manager().await?;

    info!(
        rpc = %server.local_addr(),
        logs = %log_server.local_addr(),
        "Process manager started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping process manager");

    supervisor.shutdown();
    server.shutdown().await;
    log_server.shutdown().await;
    let _ = supervisor_task.await;
    Ok(())
}

/// Spawner for worker processes: `SHARDLINE_WORKER_PROGRAM` or this binary.
/// Children inherit the environment, so they see the same configuration.
pub fn worker_spawner(config: &Config) -> std::io::Result<NativeSpawner> {
    match &config.worker_program {
        Some(program) => Ok(NativeSpawner::new(program.clone())),
        None => NativeSpawner::current_exe(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::model::ShardRange;
    use crate::runner::MockSpawner;
    use crate::supervisor::NoopObserver;

    #[derive(Default)]
    struct RecordingLink {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ManagerLink for RecordingLink {
        async fn notify(&self, method: &str, params: Value) {
            self.calls.lock().unwrap().push((method.to_string(), params));
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            ready_timeout: Duration::from_secs(1),
            restart_retry_delay: Duration::from_millis(10),
            aggregate_timeout: Duration::from_millis(100),
        }
    }

    fn manager(spawner: Arc<MockSpawner>) -> Arc<ProcessManager> {
        let supervisor = Supervisor::new(spawner, config(), Arc::new(NoopObserver));
        ProcessManager::new(supervisor, PortMap::default())
    }

    fn spec(id: u32) -> ClusterSpec {
        ClusterSpec::new(id, ShardRange::new(id * 2, id * 2 + 1, 8).unwrap(), 4)
    }

    #[tokio::test]
    async fn test_create_list_delete() {
        let manager = manager(Arc::new(MockSpawner::new()));
        manager.start_manager().await.unwrap();
        let record = manager.create(spec(2)).await.unwrap();

        assert_eq!(record.port, Some(30002));
        assert_eq!(record.cluster().map(|c| c.id), Some(2));

        let listed = manager.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, record.id);

        manager.delete(record.id).unwrap();
        assert!(manager.list().is_empty());
        assert!(manager.delete(record.id).is_err());
    }

    #[tokio::test]
    async fn test_rpc_errors() {
        let manager = manager(Arc::new(MockSpawner::new()));
        let methods = manager.rpc_methods();

        let missing = methods
            .dispatch_body(br#"{"method":"delete","params":{},"id":1}"#)
            .await;
        assert_eq!(missing.error.map(|e| e.message), Some("Missing ID".to_string()));

        let id = Uuid::new_v4();
        let body = json!({"method": "restart", "params": {"id": id}, "id": 2}).to_string();
        let unknown = methods.dispatch_body(body.as_bytes()).await;
        assert_eq!(
            unknown.error.map(|e| e.message),
            Some(format!("Process {} not found.", id))
        );
    }

    #[tokio::test]
    async fn test_rpc_create_then_restart() {
        let spawner = Arc::new(MockSpawner::new());
        let manager = manager(spawner.clone());
        let methods = manager.rpc_methods();

        let body = json!({"method": "create", "params": {"cluster": spec(1)}, "id": 1}).to_string();
        let created: ProcessRecord =
            serde_json::from_value(methods.dispatch_body(body.as_bytes()).await.into_result().unwrap())
                .unwrap();
        let first_pid = created.pid;

        let body = json!({"method": "restart", "params": {"id": created.id}, "id": 2}).to_string();
        let restarted: ProcessRecord =
            serde_json::from_value(methods.dispatch_body(body.as_bytes()).await.into_result().unwrap())
                .unwrap();
        assert_eq!(restarted.id, created.id);
        assert_ne!(restarted.pid, first_pid);
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_relay_notices() {
        let link = Arc::new(RecordingLink::default());
        let observer = RelayObserver::new(link.clone(), PortMap::default());
        let spawner = Arc::new(MockSpawner::new());
        let supervisor = Supervisor::new(spawner, config(), Arc::new(NoopObserver));
        let uuid = Uuid::new_v4();
        let handle = supervisor
            .spawn(WorkerId::Process(uuid), WorkerRole::Cluster(spec(3)), Some(uuid), false)
            .await
            .unwrap();

        observer
            .notice(
                &handle,
                WorkerNotice::ShardDisconnect {
                    cluster: Some(3),
                    shard: 6,
                    err: Some("1006".to_string()),
                },
            )
            .await;
        observer
            .notice(&handle, WorkerNotice::ShardIdentify { cluster: Some(3), shard: 6 })
            .await;
        observer.unexpected_exit(&handle, ExitInfo::code(1)).await;

        let calls = link.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "shardDisconnect");
        assert_eq!(calls[0].1, json!({"id": 6, "cluster": 3, "err": "1006"}));
        assert_eq!(calls[1].0, "processExit");
        assert_eq!(calls[1].1["code"], json!(1));
        assert_eq!(calls[1].1["process"]["id"], json!(uuid));
    }
}
