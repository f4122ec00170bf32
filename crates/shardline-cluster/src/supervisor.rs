// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker supervisor.
//!
//! Owns the process registry and reacts to everything workers do:
//!
//! - unexpected exits trigger an unconditional restart, retried after a
//!   delay until it succeeds (SIGTERM exits are exempt);
//! - notices (blocked, shard status) go to the [`LifecycleObserver`];
//! - worker requests are answered with an aggregated fleet query;
//! - worker restart requests go through the restart queue;
//! - broadcasts are forwarded to every worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use shardline_protocol::{DiagnosticQuery, ManagerMessage, Reply, ReplyError, WorkerMessage};
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fan_in::{EmbedField, LogFanIn, StatusSink, WorkerNotice};
use crate::model::{ClusterSpec, WorkerId, WorkerRole};
use crate::registry::ProcessRegistry;
use crate::restart_queue::RestartQueue;
use crate::runner::{ExitInfo, ProcessSpawner};
use crate::worker::{PidRole, WorkerContext, WorkerEvent, WorkerHandle};

/// Supervisor timing.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Bound on waiting for a (re)started worker to report ready.
    pub ready_timeout: Duration,
    /// Pause before retrying a failed crash restart.
    pub restart_retry_delay: Duration,
    /// Per-worker timeout of aggregated requests.
    pub aggregate_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(15 * 60),
            restart_retry_delay: Duration::from_secs(1),
            aggregate_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        Self {
            ready_timeout: config.ready_timeout,
            restart_retry_delay: config.restart_retry_delay,
            aggregate_timeout: config.aggregate_timeout,
        }
    }
}

/// Hooks for reporting worker lifecycle outside the process.
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    /// A worker's current process died with something other than SIGTERM.
    /// Called before the restart starts.
    async fn unexpected_exit(&self, _handle: &WorkerHandle, _exit: ExitInfo) {}

    /// A crashed worker is running again.
    async fn recovered(&self, _handle: &WorkerHandle, _pid: u32) {}

    /// A worker reported a notice.
    async fn notice(&self, _handle: &WorkerHandle, _notice: WorkerNotice) {}
}

/// Observer that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl LifecycleObserver for NoopObserver {}

/// Short label of a worker: the cluster id, or the worker id for the
/// manager role.
pub fn worker_label(handle: &WorkerHandle) -> String {
    match handle.role().cluster() {
        Some(spec) => spec.id.to_string(),
        None => handle.id().to_string(),
    }
}

/// Shard range of a worker for log fields, e.g. `12-15`.
pub fn shard_meta(handle: &WorkerHandle) -> String {
    match handle.role().cluster() {
        Some(spec) => spec.shards.to_string(),
        None => worker_label(handle),
    }
}

/// Posts lifecycle messages to a sink and buffers notices in a fan-in.
pub struct ReportingObserver {
    fan_in: Arc<LogFanIn>,
    sink: Arc<dyn StatusSink>,
}

impl ReportingObserver {
    /// Observer posting lifecycle messages to `sink`.
    pub fn new(fan_in: Arc<LogFanIn>, sink: Arc<dyn StatusSink>) -> Self {
        Self { fan_in, sink }
    }
}

#[async_trait]
impl LifecycleObserver for ReportingObserver {
    async fn unexpected_exit(&self, handle: &WorkerHandle, exit: ExitInfo) {
        let title = format!(
            "Cluster {} died with code {}, restarting...",
            worker_label(handle),
            exit
        );
        let fields = [EmbedField::new("Shards", shard_meta(handle))];
        if let Err(e) = self.sink.post(&title, None, &fields).await {
            warn!(error = %e, "Failed to post exit notice");
        }
    }

    async fn recovered(&self, handle: &WorkerHandle, _pid: u32) {
        let title = format!("Cluster {} ready.", worker_label(handle));
        if let Err(e) = self.sink.post(&title, None, &[]).await {
            warn!(error = %e, "Failed to post ready notice");
        }
    }

    async fn notice(&self, _handle: &WorkerHandle, notice: WorkerNotice) {
        self.fan_in.record(&notice);
    }
}

/// One worker's answer within an aggregated request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateEntry {
    /// Answering worker (cluster id for clusters).
    pub id: Value,
    /// Answer, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error text, on failure or timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Supervises every worker of one process.
pub struct Supervisor {
    registry: ProcessRegistry,
    context: WorkerContext,
    config: SupervisorConfig,
    observer: Arc<dyn LifecycleObserver>,
    queue: RestartQueue<Arc<WorkerHandle>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    stopping: AtomicBool,
    shutdown: Arc<Notify>,
}

impl Supervisor {
    /// Supervisor spawning through `spawner`. Call [`run`](Self::run) to
    /// start reacting to worker events.
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        config: SupervisorConfig,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            registry: ProcessRegistry::new(),
            context: WorkerContext {
                spawner,
                events: events_tx,
                ready_timeout: config.ready_timeout,
            },
            config,
            observer,
            queue: RestartQueue::new(),
            events: Mutex::new(Some(events_rx)),
            stopping: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// The registry.
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Timing.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn and register a worker. An existing worker with the same id is
    /// replaced and terminated.
    pub async fn spawn(
        &self,
        id: WorkerId,
        role: WorkerRole,
        uuid: Option<Uuid>,
        await_ready: bool,
    ) -> Result<Arc<WorkerHandle>> {
        let handle = WorkerHandle::spawn(id, role, uuid, self.context.clone(), await_ready).await?;
        if let Some(previous) = self.registry.set(handle.clone()) {
            warn!(worker = %id, "Replacing registered worker");
            previous.terminate();
        }
        Ok(handle)
    }

    /// Spawn a cluster keyed by its cluster id.
    pub async fn spawn_cluster(&self, spec: ClusterSpec, await_ready: bool) -> Result<Arc<WorkerHandle>> {
        let id = WorkerId::Cluster(spec.id);
        self.spawn(id, WorkerRole::Cluster(spec), None, await_ready).await
    }

    /// Restart one worker now, bypassing the queue.
    pub async fn restart_worker(&self, id: &WorkerId) -> Result<u32> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
        handle.restart(true).await
    }

    /// Queue a restart of one worker.
    pub fn enqueue_restart(&self, id: &WorkerId) -> Result<oneshot::Receiver<Result<()>>> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
        Ok(self.queue.enqueue(handle))
    }

    /// Restart every worker one at a time, in id order, each awaiting its
    /// readiness barrier. Returns one result per worker.
    pub async fn restart_all(&self) -> Vec<(String, Result<()>)> {
        let handles: Vec<_> = self
            .registry
            .handles()
            .into_iter()
            .filter(|handle| !handle.is_retired())
            .collect();
        info!(workers = handles.len(), "Restarting all workers");
        self.queue.restart_all(handles).await
    }

    /// Remove a worker and SIGTERM its processes.
    pub fn delete(&self, id: &WorkerId) -> Result<Arc<WorkerHandle>> {
        let handle = self
            .registry
            .remove(id)
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))?;
        handle.terminate();
        info!(worker = %id, "Worker deleted");
        Ok(handle)
    }

    /// Send `message` to every live worker without waiting for replies.
    /// Returns how many workers it was written to.
    pub async fn broadcast(&self, message: ManagerMessage) -> usize {
        let handles: Vec<_> = self
            .registry
            .handles()
            .into_iter()
            .filter(|handle| handle.is_alive())
            .collect();

        let sends = handles.iter().map(|handle| {
            let message = &message;
            async move {
                match handle.send(message).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(worker = %handle.id(), error = %e, "Broadcast delivery failed");
                        false
                    }
                }
            }
        });

        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    /// Ask every live worker `query` concurrently.
    ///
    /// Always returns one entry per live worker. Workers that fail or do
    /// not answer within the aggregate timeout get an error entry.
    pub async fn aggregate(&self, query: DiagnosticQuery) -> Vec<AggregateEntry> {
        let handles: Vec<_> = self
            .registry
            .handles()
            .into_iter()
            .filter(|handle| handle.is_alive())
            .collect();
        let timeout = self.config.aggregate_timeout;

        let requests = handles.iter().map(|handle| async move {
            let id = match handle.role().cluster() {
                Some(spec) => Value::from(spec.id),
                None => Value::from(handle.id().to_string()),
            };
            match handle.request(query, timeout).await {
                Ok(result) => AggregateEntry {
                    id,
                    result: Some(result),
                    error: None,
                },
                Err(e) => AggregateEntry {
                    id,
                    result: None,
                    error: Some(e.to_string()),
                },
            }
        });

        join_all(requests).await
    }

    /// Handle used to stop [`run`](Self::run).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// True once shutdown started.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Stop reacting to events and SIGTERM every worker.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.shutdown.notify_one();
        for handle in self.registry.handles() {
            handle.terminate();
        }
    }

    /// React to worker events until shutdown. Only the first call runs.
    pub async fn run(self: Arc<Self>) {
        let events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut events) = events else {
            warn!("Supervisor event loop already running");
            return;
        };

        info!("Supervisor started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Supervisor received shutdown signal");
                    break;
                }

                event = events.recv() => match event {
                    Some(WorkerEvent::Exited { worker, pid, exit }) => {
                        tokio::spawn(self.clone().handle_exit(worker, pid, exit));
                    }
                    Some(WorkerEvent::Message { worker, pid, message }) => {
                        self.clone().handle_message(worker, pid, message).await;
                    }
                    None => break,
                },
            }
        }

        info!("Supervisor stopped");
    }

    async fn handle_exit(self: Arc<Self>, worker: WorkerId, pid: u32, exit: ExitInfo) {
        let Some(handle) = self.registry.find_by_pid(pid) else {
            debug!(worker = %worker, pid, exit = %exit, "Exit of untracked process");
            return;
        };

        match handle.pid_role(pid) {
            Some(PidRole::Current) => {}
            Some(PidRole::Replacement) => {
                debug!(worker = %worker, pid, "Replacement exited, restart reports it");
                return;
            }
            None => return,
        }

        if exit.is_graceful_termination() {
            info!(worker = %worker, pid, "Worker terminated with SIGTERM, not restarting");
            return;
        }
        if handle.is_retired() || self.is_stopping() {
            return;
        }

        error!(
            worker = %worker,
            pid,
            shards = %shard_meta(&handle),
            "Cluster {} died with code {}, restarting...",
            worker_label(&handle),
            exit
        );
        self.observer.unexpected_exit(&handle, exit).await;

        loop {
            match handle.recover().await {
                Ok(Some(new_pid)) => {
                    info!(worker = %worker, pid = new_pid, "Worker recovered");
                    self.observer.recovered(&handle, new_pid).await;
                    return;
                }
                Ok(None) | Err(Error::WorkerRemoved(_)) => return,
                Err(e) => {
                    error!(worker = %worker, error = %e, "Restart after crash failed, retrying");
                }
            }
            if self.is_stopping() {
                return;
            }
            tokio::time::sleep(self.config.restart_retry_delay).await;
        }
    }

    async fn handle_message(self: Arc<Self>, worker: WorkerId, pid: u32, message: WorkerMessage) {
        let Some(handle) = self.registry.get(&worker) else {
            debug!(worker = %worker, pid, "Message from unregistered worker");
            return;
        };
        let cluster = handle.role().cluster().map(|spec| spec.id);

        let notice = match message {
            WorkerMessage::Ready => {
                debug!(worker = %worker, pid, "Worker ready");
                return;
            }
            WorkerMessage::ShardReady(shard) => WorkerNotice::ShardReady { cluster, shard },
            WorkerMessage::ShardResume(shard) => WorkerNotice::ShardResume { cluster, shard },
            WorkerMessage::ShardIdentify(shard) => WorkerNotice::ShardIdentify { cluster, shard },
            WorkerMessage::ShardDisconnect(disconnect) => WorkerNotice::ShardDisconnect {
                cluster,
                shard: disconnect.id,
                err: disconnect.err,
            },
            WorkerMessage::Blocked(text) => WorkerNotice::Blocked(text),
            WorkerMessage::Request(request) => {
                tokio::spawn(async move {
                    let entries = self.aggregate(request.query).await;
                    let reply = match serde_json::to_value(&entries) {
                        Ok(result) => ManagerMessage::Response(Reply {
                            id: request.id,
                            result,
                        }),
                        Err(e) => ManagerMessage::Error(ReplyError {
                            id: request.id,
                            error: e.to_string(),
                        }),
                    };
                    if let Err(e) = handle.send_to(pid, &reply).await {
                        warn!(worker = %worker, pid, error = %e, "Failed to answer worker request");
                    }
                });
                return;
            }
            WorkerMessage::Restart(Some(cluster_id)) => {
                match self.registry.find_cluster(cluster_id) {
                    Some(target) => {
                        tokio::spawn(async move {
                            if let Err(e) = target.restart(true).await {
                                error!(cluster_id, error = %e, "Requested restart failed");
                            }
                        });
                    }
                    None => warn!(cluster_id, "Restart requested for unknown cluster"),
                }
                return;
            }
            WorkerMessage::Restart(None) => {
                tokio::spawn(async move {
                    self.restart_all().await;
                });
                return;
            }
            WorkerMessage::Broadcast(payload) => {
                self.broadcast(ManagerMessage::Broadcast(payload)).await;
                return;
            }
            WorkerMessage::Response(_) | WorkerMessage::Error(_) => {
                debug!(worker = %worker, pid, "Unsolicited reply from worker");
                return;
            }
        };

        self.observer.notice(&handle, notice).await;
    }
}
