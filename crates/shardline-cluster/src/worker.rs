// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervised worker handles.
//!
//! A [`WorkerHandle`] owns the process currently serving one logical worker
//! (a cluster or the cluster manager role). Restarts are make-before-break:
//! the replacement is spawned and must report ready before the old process
//! receives SIGTERM. While a restart is in flight the handle tracks both
//! pids so exit events for either one resolve to this handle.
//!
//! Handle state is derived, never stored:
//!
//! | Condition                         | State        |
//! |-----------------------------------|--------------|
//! | restart in flight                 | `Restarting` |
//! | no live process                   | `Dead`       |
//! | live process that reported ready  | `Ready`      |
//! | live process, not yet ready       | `Starting`   |

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nix::sys::signal::Signal;
use serde::Serialize;
use serde_json::Value;
use shardline_protocol::{DiagnosticQuery, ManagerMessage, QueryRequest, WorkerMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{PortMap, ProcessRecord, SpawnRequest, WorkerId, WorkerRole};
use crate::runner::{ExitInfo, ProcessControl, ProcessSpawner};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Spawned, waiting for the ready signal.
    Starting,
    /// The process reported ready.
    Ready,
    /// A replacement is being started.
    Restarting,
    /// No live process.
    Dead,
}

/// Something a worker process did, as seen by its supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The process sent a message that is not a reply to a handle request.
    Message {
        /// Owning worker.
        worker: WorkerId,
        /// Sending process.
        pid: u32,
        /// The message.
        message: WorkerMessage,
    },
    /// The process exited.
    Exited {
        /// Owning worker.
        worker: WorkerId,
        /// Exited process.
        pid: u32,
        /// How it exited.
        exit: ExitInfo,
    },
}

/// Which of a handle's processes a pid refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidRole {
    /// The process currently serving the worker.
    Current,
    /// A replacement still waiting to report ready.
    Replacement,
}

/// Shared dependencies of every handle created by one supervisor.
#[derive(Clone)]
pub struct WorkerContext {
    /// Starts processes.
    pub spawner: Arc<dyn ProcessSpawner>,
    /// Receives messages and exits from every process.
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    /// Bound on waiting for a replacement to report ready.
    pub ready_timeout: Duration,
}

/// Point-in-time view of a handle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    /// Worker id.
    pub id: WorkerId,
    /// Pid of the current process.
    pub underlying_pid: Option<u32>,
    /// When the current process was spawned.
    pub spawned_at: Option<DateTime<Utc>>,
    /// Spawn options.
    pub options: WorkerRole,
    /// Lifecycle state.
    pub state: WorkerState,
}

type PendingReply = oneshot::Sender<std::result::Result<Value, String>>;

enum ReadyOutcome {
    Ready,
    Exited(ExitInfo),
    TimedOut,
}

struct ProcessSlot {
    pid: u32,
    control: Arc<dyn ProcessControl>,
    ready: watch::Receiver<bool>,
    exited: watch::Receiver<Option<ExitInfo>>,
    pending: Arc<DashMap<u64, PendingReply>>,
    spawned_at: DateTime<Utc>,
}

impl ProcessSlot {
    fn is_alive(&self) -> bool {
        self.exited.borrow().is_none()
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    fn signal(&self, signal: Signal) {
        if !self.is_alive() {
            return;
        }
        if let Err(e) = self.control.signal(signal) {
            warn!(pid = self.pid, signal = %signal, error = %e, "Failed to signal worker process");
        }
    }

    async fn wait_ready(&self, timeout: Duration) -> ReadyOutcome {
        let mut ready = self.ready.clone();
        let mut exited = self.exited.clone();

        let wait = async {
            tokio::select! {
                biased;

                is_ready = async { ready.wait_for(|r| *r).await.is_ok() } => {
                    if is_ready {
                        ReadyOutcome::Ready
                    } else {
                        ReadyOutcome::Exited((*self.exited.borrow()).unwrap_or_default())
                    }
                }

                exit = async { exited.wait_for(Option::is_some).await.ok().and_then(|e| *e) } => {
                    ReadyOutcome::Exited(exit.unwrap_or_default())
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(ReadyOutcome::TimedOut)
    }
}

#[derive(Default)]
struct Slots {
    restarting: bool,
    current: Option<Arc<ProcessSlot>>,
    replacement: Option<Arc<ProcessSlot>>,
}

/// One supervised worker.
pub struct WorkerHandle {
    id: WorkerId,
    role: WorkerRole,
    uuid: Option<Uuid>,
    context: WorkerContext,
    slots: Mutex<Slots>,
    restart_lock: tokio::sync::Mutex<()>,
    next_request_id: AtomicU64,
    retired: AtomicBool,
}

impl WorkerHandle {
    /// Spawn the first process for a worker and return in `Starting` state.
    pub async fn spawn(
        id: WorkerId,
        role: WorkerRole,
        uuid: Option<Uuid>,
        context: WorkerContext,
        await_ready: bool,
    ) -> Result<Arc<Self>> {
        let handle = Arc::new(Self {
            id,
            role,
            uuid,
            context,
            slots: Mutex::new(Slots::default()),
            restart_lock: tokio::sync::Mutex::new(()),
            next_request_id: AtomicU64::new(1),
            retired: AtomicBool::new(false),
        });

        let slot = handle.spawn_process(await_ready).await?;
        info!(
            worker = %handle.id,
            pid = slot.pid,
            role = %handle.role.describe(),
            "Worker spawned"
        );
        handle.slots().current = Some(slot);
        Ok(handle)
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Worker id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Spawn options.
    pub fn role(&self) -> &WorkerRole {
        &self.role
    }

    /// Process record id (hosted topology).
    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    fn current(&self) -> Option<Arc<ProcessSlot>> {
        self.slots().current.clone()
    }

    fn live_current(&self) -> Result<Arc<ProcessSlot>> {
        self.current()
            .filter(|slot| slot.is_alive())
            .ok_or(Error::WorkerNotRunning(self.id))
    }

    /// Pid of the current process.
    pub fn pid(&self) -> Option<u32> {
        self.slots().current.as_ref().map(|slot| slot.pid)
    }

    /// Pid of the in-flight replacement, if a restart is running.
    pub fn replacement_pid(&self) -> Option<u32> {
        self.slots().replacement.as_ref().map(|slot| slot.pid)
    }

    /// Which of this handle's processes `pid` is.
    pub fn pid_role(&self, pid: u32) -> Option<PidRole> {
        let slots = self.slots();
        if slots.current.as_ref().is_some_and(|slot| slot.pid == pid) {
            Some(PidRole::Current)
        } else if slots.replacement.as_ref().is_some_and(|slot| slot.pid == pid) {
            Some(PidRole::Replacement)
        } else {
            None
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        let slots = self.slots();
        if slots.restarting {
            return WorkerState::Restarting;
        }
        match &slots.current {
            Some(slot) if slot.is_alive() && slot.is_ready() => WorkerState::Ready,
            Some(slot) if slot.is_alive() => WorkerState::Starting,
            _ => WorkerState::Dead,
        }
    }

    /// True while the current process runs.
    pub fn is_alive(&self) -> bool {
        self.current().is_some_and(|slot| slot.is_alive())
    }

    /// True once [`terminate`](Self::terminate) was called.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Snapshot for listings.
    pub fn info(&self) -> WorkerInfo {
        let current = self.current();
        WorkerInfo {
            id: self.id,
            underlying_pid: current.as_ref().map(|slot| slot.pid),
            spawned_at: current.as_ref().map(|slot| slot.spawned_at),
            options: self.role.clone(),
            state: self.state(),
        }
    }

    /// Process record, for handles created with a uuid.
    pub fn record(&self, ports: PortMap) -> Option<ProcessRecord> {
        let uuid = self.uuid?;
        let current = self.current();
        Some(ProcessRecord {
            id: uuid,
            pid: current.as_ref().map(|slot| slot.pid),
            port: self.role.port(ports),
            options: self.role.clone(),
            created_at: current
                .as_ref()
                .map(|slot| slot.spawned_at)
                .unwrap_or_else(Utc::now),
        })
    }

    /// Wait until the current process reports ready.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let slot = self.live_current()?;
        match slot.wait_ready(timeout).await {
            ReadyOutcome::Ready => Ok(()),
            ReadyOutcome::Exited(exit) => Err(Error::WorkerExited {
                worker: self.id,
                exit,
            }),
            ReadyOutcome::TimedOut => Err(Error::ReadyTimeout {
                worker: self.id,
                timeout,
            }),
        }
    }

    /// Write one message to the current process.
    pub async fn send(&self, message: &ManagerMessage) -> Result<()> {
        let slot = self.live_current()?;
        slot.control.send(message).await?;
        Ok(())
    }

    /// Write one message to the process with `pid`, which may be the
    /// current process or an in-flight replacement.
    pub async fn send_to(&self, pid: u32, message: &ManagerMessage) -> Result<()> {
        let slot = {
            let slots = self.slots();
            slots
                .current
                .iter()
                .chain(slots.replacement.iter())
                .find(|slot| slot.pid == pid && slot.is_alive())
                .cloned()
        };
        let slot = slot.ok_or(Error::WorkerNotRunning(self.id))?;
        slot.control.send(message).await?;
        Ok(())
    }

    /// Ask the current process a diagnostic query and wait for the
    /// correlated reply.
    pub async fn request(&self, query: DiagnosticQuery, timeout: Duration) -> Result<Value> {
        let slot = self.live_current()?;
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        slot.pending.insert(id, tx);

        let message = ManagerMessage::Request(QueryRequest { id, query });
        if let Err(e) = slot.control.send(&message).await {
            slot.pending.remove(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(Error::WorkerReply {
                worker: self.id,
                message,
            }),
            Ok(Err(_)) => Err(Error::WorkerNotRunning(self.id)),
            Err(_) => {
                slot.pending.remove(&id);
                Err(Error::RequestTimeout)
            }
        }
    }

    /// Make-before-break restart.
    ///
    /// Spawns a replacement, waits up to the ready timeout for it, then
    /// swaps it in and sends SIGTERM to the old process. If the replacement
    /// exits or times out it is killed, the old process keeps running and
    /// the error is returned. Restarts of one handle are serialized.
    pub async fn restart(&self, await_ready: bool) -> Result<u32> {
        let _guard = self.restart_lock.lock().await;
        self.restart_locked(await_ready).await
    }

    /// Replace the current process if it is dead. Returns the new pid, or
    /// `None` when nothing had to be done.
    pub async fn recover(&self) -> Result<Option<u32>> {
        let _guard = self.restart_lock.lock().await;
        if self.is_retired() || self.is_alive() {
            return Ok(None);
        }
        self.restart_locked(false).await.map(Some)
    }

    async fn restart_locked(&self, await_ready: bool) -> Result<u32> {
        if self.is_retired() {
            return Err(Error::WorkerRemoved(self.id));
        }

        self.slots().restarting = true;
        let result = self.swap(await_ready).await;
        {
            let mut slots = self.slots();
            slots.restarting = false;
            slots.replacement = None;
        }
        result
    }

    async fn swap(&self, await_ready: bool) -> Result<u32> {
        let replacement = self.spawn_process(await_ready).await?;
        debug!(worker = %self.id, pid = replacement.pid, "Replacement spawned");
        self.slots().replacement = Some(replacement.clone());

        let timeout = self.context.ready_timeout;
        match replacement.wait_ready(timeout).await {
            ReadyOutcome::Ready => {}
            ReadyOutcome::Exited(exit) => {
                warn!(worker = %self.id, pid = replacement.pid, exit = %exit, "Replacement exited before ready");
                return Err(Error::WorkerExited {
                    worker: self.id,
                    exit,
                });
            }
            ReadyOutcome::TimedOut => {
                warn!(
                    worker = %self.id,
                    pid = replacement.pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "Replacement never reported ready, killing it"
                );
                replacement.signal(Signal::SIGKILL);
                return Err(Error::ReadyTimeout {
                    worker: self.id,
                    timeout,
                });
            }
        }

        if self.is_retired() {
            replacement.signal(Signal::SIGTERM);
            return Err(Error::WorkerRemoved(self.id));
        }

        let old = self.slots().current.replace(replacement.clone());
        if let Some(old) = old {
            old.signal(Signal::SIGTERM);
        }

        info!(worker = %self.id, pid = replacement.pid, "Worker restarted");
        Ok(replacement.pid)
    }

    /// Retire the handle and SIGTERM its processes. A retired handle is
    /// never restarted.
    pub fn terminate(&self) {
        self.retired.store(true, Ordering::Release);
        let slots = self.slots();
        for slot in slots.current.iter().chain(slots.replacement.iter()) {
            slot.signal(Signal::SIGTERM);
        }
    }

    async fn spawn_process(&self, await_ready: bool) -> Result<Arc<ProcessSlot>> {
        let request = SpawnRequest {
            worker: self.id,
            role: self.role.clone(),
            uuid: self.uuid,
            await_ready,
        };
        let spawned = self.context.spawner.spawn(&request).await?;

        let (ready_tx, ready_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = watch::channel(None);
        let pending = Arc::new(DashMap::new());

        tokio::spawn(pump(
            Pump {
                worker: self.id,
                pid: spawned.pid,
                ready: ready_tx,
                exited: exited_tx,
                pending: pending.clone(),
                events: self.context.events.clone(),
            },
            spawned.messages,
            spawned.exit,
        ));

        Ok(Arc::new(ProcessSlot {
            pid: spawned.pid,
            control: spawned.control,
            ready: ready_rx,
            exited: exited_rx,
            pending,
            spawned_at: Utc::now(),
        }))
    }
}

struct Pump {
    worker: WorkerId,
    pid: u32,
    ready: watch::Sender<bool>,
    exited: watch::Sender<Option<ExitInfo>>,
    pending: Arc<DashMap<u64, PendingReply>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Pump {
    fn dispatch(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::Response(reply) => self.resolve(reply.id, Ok(reply.result)),
            WorkerMessage::Error(reply) => self.resolve(reply.id, Err(reply.error)),
            message => {
                if matches!(message, WorkerMessage::Ready) {
                    self.ready.send_replace(true);
                }
                let _ = self.events.send(WorkerEvent::Message {
                    worker: self.worker,
                    pid: self.pid,
                    message,
                });
            }
        }
    }

    fn resolve(&self, id: u64, reply: std::result::Result<Value, String>) {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => debug!(worker = %self.worker, pid = self.pid, id, "Reply for unknown request"),
        }
    }
}

/// Route one process's messages until it exits.
async fn pump(
    pump: Pump,
    mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
    mut exit: oneshot::Receiver<ExitInfo>,
) {
    let exit = loop {
        tokio::select! {
            biased;

            message = messages.recv() => match message {
                Some(message) => pump.dispatch(message),
                None => break (&mut exit).await.unwrap_or_default(),
            },

            result = &mut exit => {
                while let Ok(message) = messages.try_recv() {
                    pump.dispatch(message);
                }
                break result.unwrap_or_default();
            }
        }
    };

    pump.exited.send_replace(Some(exit));
    pump.pending.clear();
    let _ = pump.events.send(WorkerEvent::Exited {
        worker: pump.worker,
        pid: pump.pid,
        exit,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterSpec, ShardRange};
    use crate::runner::MockSpawner;

    fn context(spawner: Arc<MockSpawner>) -> (WorkerContext, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            WorkerContext {
                spawner,
                events,
                ready_timeout: Duration::from_millis(300),
            },
            rx,
        )
    }

    fn role(id: u32) -> WorkerRole {
        WorkerRole::Cluster(ClusterSpec::new(id, ShardRange::single(id, 4).unwrap(), 4))
    }

    #[tokio::test]
    async fn test_starting_then_ready() {
        let spawner = Arc::new(MockSpawner::manual());
        let (context, _events) = context(spawner.clone());
        let handle = WorkerHandle::spawn(WorkerId::Cluster(0), role(0), None, context, false)
            .await
            .unwrap();

        assert_eq!(handle.state(), WorkerState::Starting);
        spawner.latest(WorkerId::Cluster(0)).unwrap().ready();
        handle.wait_ready(Duration::from_secs(1)).await.unwrap();
        assert_eq!(handle.state(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn test_restart_is_make_before_break() {
        let spawner = Arc::new(MockSpawner::manual());
        let (context, _events) = context(spawner.clone());
        let handle = WorkerHandle::spawn(WorkerId::Cluster(1), role(1), None, context, false)
            .await
            .unwrap();
        let old = spawner.latest(WorkerId::Cluster(1)).unwrap();
        old.ready();

        let restarting = handle.clone();
        let task = tokio::spawn(async move { restarting.restart(true).await });
        spawner.wait_for_spawns(2).await;

        assert_eq!(handle.state(), WorkerState::Restarting);
        assert!(old.signals().is_empty());
        assert_eq!(handle.pid(), Some(old.pid()));

        let new = spawner.latest(WorkerId::Cluster(1)).unwrap();
        assert_eq!(handle.pid_role(new.pid()), Some(PidRole::Replacement));
        new.ready();

        let pid = task.await.unwrap().unwrap();
        assert_eq!(pid, new.pid());
        assert_eq!(old.signals(), vec![Signal::SIGTERM]);
        assert_eq!(handle.pid(), Some(new.pid()));
        assert_eq!(handle.state(), WorkerState::Ready);
        assert_eq!(handle.pid_role(old.pid()), None);
    }

    #[tokio::test]
    async fn test_restart_timeout_keeps_old_process() {
        let spawner = Arc::new(MockSpawner::new());
        let (context, _events) = context(spawner.clone());
        let handle = WorkerHandle::spawn(WorkerId::Cluster(2), role(2), None, context, false)
            .await
            .unwrap();
        let old = spawner.latest(WorkerId::Cluster(2)).unwrap();

        spawner.never_ready(WorkerId::Cluster(2));
        let err = handle.restart(false).await.unwrap_err();
        assert!(matches!(err, Error::ReadyTimeout { .. }));

        let replacement = spawner.latest(WorkerId::Cluster(2)).unwrap();
        assert_eq!(replacement.signals(), vec![Signal::SIGKILL]);
        assert!(old.signals().is_empty());
        assert_eq!(handle.pid(), Some(old.pid()));
        assert_ne!(handle.state(), WorkerState::Restarting);
    }

    #[tokio::test]
    async fn test_replacement_crash_fails_restart() {
        let spawner = Arc::new(MockSpawner::manual());
        let (context, _events) = context(spawner.clone());
        let handle = WorkerHandle::spawn(WorkerId::Cluster(3), role(3), None, context, false)
            .await
            .unwrap();

        let restarting = handle.clone();
        let task = tokio::spawn(async move { restarting.restart(false).await });
        spawner.wait_for_spawns(2).await;
        spawner.latest(WorkerId::Cluster(3)).unwrap().crash(1);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::WorkerExited { exit, .. } if exit.code == Some(1)));
    }

    #[tokio::test]
    async fn test_request_correlates_reply() {
        let spawner = Arc::new(MockSpawner::new());
        let (context, _events) = context(spawner.clone());
        let handle = WorkerHandle::spawn(WorkerId::Cluster(0), role(0), None, context, false)
            .await
            .unwrap();

        let value = handle
            .request(DiagnosticQuery::Shards, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value["worker"], "0");
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let spawner = Arc::new(MockSpawner::new().with_responder(|_, _| None));
        let (context, _events) = context(spawner.clone());
        let handle = WorkerHandle::spawn(WorkerId::Cluster(0), role(0), None, context, false)
            .await
            .unwrap();

        let err = handle
            .request(DiagnosticQuery::Stats, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout));
    }

    #[tokio::test]
    async fn test_exit_event_and_recover() {
        let spawner = Arc::new(MockSpawner::new());
        let (context, mut events) = context(spawner.clone());
        let handle = WorkerHandle::spawn(WorkerId::Cluster(5), role(5), None, context, false)
            .await
            .unwrap();
        let first = spawner.latest(WorkerId::Cluster(5)).unwrap();
        first.crash(3);

        loop {
            match events.recv().await.unwrap() {
                WorkerEvent::Exited { pid, exit, .. } => {
                    assert_eq!(pid, first.pid());
                    assert_eq!(exit.code, Some(3));
                    break;
                }
                WorkerEvent::Message { .. } => continue,
            }
        }
        assert_eq!(handle.state(), WorkerState::Dead);

        let pid = handle.recover().await.unwrap();
        assert!(pid.is_some());
        assert!(handle.recover().await.unwrap().is_none());
        assert_eq!(handle.state(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn test_terminate_retires() {
        let spawner = Arc::new(MockSpawner::new());
        let (context, _events) = context(spawner.clone());
        let handle = WorkerHandle::spawn(WorkerId::Cluster(6), role(6), None, context, false)
            .await
            .unwrap();
        handle.terminate();
        assert!(handle.is_retired());
        assert_eq!(
            spawner.latest(WorkerId::Cluster(6)).unwrap().signals(),
            vec![Signal::SIGTERM]
        );
        assert!(matches!(
            handle.restart(false).await,
            Err(Error::WorkerRemoved(_))
        ));
    }
}
