// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock spawner for testing.
//!
//! Simulates worker processes in memory. Tests drive each process by hand
//! (report ready, crash, emit notices) or let the spawner report ready
//! immediately.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde_json::{Value, json};
use shardline_protocol::{IpcError, ManagerMessage, QueryRequest, Reply, WorkerMessage};
use tokio::sync::{mpsc, oneshot, watch};

use super::traits::*;
use crate::model::{SpawnRequest, WorkerId};

/// Computes a mock process's answer to a diagnostic query. `None` means the
/// process never answers.
pub type Responder = Arc<dyn Fn(&SpawnRequest, &QueryRequest) -> Option<Value> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MockProcessInner {
    pid: u32,
    request: SpawnRequest,
    to_parent: mpsc::UnboundedSender<WorkerMessage>,
    exit: Mutex<Option<oneshot::Sender<ExitInfo>>>,
    sent: Mutex<Vec<ManagerMessage>>,
    signals: Mutex<Vec<Signal>>,
    responder: Option<Responder>,
}

/// A simulated worker process.
#[derive(Clone)]
pub struct MockProcess {
    inner: Arc<MockProcessInner>,
}

impl std::fmt::Debug for MockProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProcess")
            .field("pid", &self.inner.pid)
            .field("worker", &self.inner.request.worker)
            .field("running", &self.is_running())
            .finish()
    }
}

impl MockProcess {
    /// Simulated pid.
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// The request this process was spawned with.
    pub fn request(&self) -> &SpawnRequest {
        &self.inner.request
    }

    /// Worker this process belongs to.
    pub fn worker(&self) -> WorkerId {
        self.inner.request.worker
    }

    /// Send a message to the supervisor as if the process wrote it.
    pub fn emit(&self, message: WorkerMessage) {
        let _ = self.inner.to_parent.send(message);
    }

    /// Report ready.
    pub fn ready(&self) {
        self.emit(WorkerMessage::Ready);
    }

    /// End the process with `exit`. Later calls are ignored.
    pub fn exit(&self, exit: ExitInfo) {
        if let Some(tx) = lock(&self.inner.exit).take() {
            let _ = tx.send(exit);
        }
    }

    /// Exit with a non-zero code, as a crash.
    pub fn crash(&self, code: i32) {
        self.exit(ExitInfo::code(code));
    }

    /// True until the process exits.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.exit).is_some()
    }

    /// Messages the supervisor sent to this process.
    pub fn sent(&self) -> Vec<ManagerMessage> {
        lock(&self.inner.sent).clone()
    }

    /// Signals delivered to this process.
    pub fn signals(&self) -> Vec<Signal> {
        lock(&self.inner.signals).clone()
    }
}

#[derive(Debug)]
struct MockControl {
    process: MockProcess,
}

#[async_trait]
impl ProcessControl for MockControl {
    fn pid(&self) -> u32 {
        self.process.pid()
    }

    async fn send(&self, message: &ManagerMessage) -> Result<(), SpawnError> {
        if !self.process.is_running() {
            return Err(SpawnError::Ipc(IpcError::ChannelClosed));
        }
        lock(&self.process.inner.sent).push(message.clone());

        if let (ManagerMessage::Request(query), Some(responder)) =
            (message, &self.process.inner.responder)
            && let Some(result) = responder(self.process.request(), query)
        {
            self.process.emit(WorkerMessage::Response(Reply {
                id: query.id,
                result,
            }));
        }
        Ok(())
    }

    fn signal(&self, signal: Signal) -> Result<(), SpawnError> {
        lock(&self.process.inner.signals).push(signal);
        if matches!(signal, Signal::SIGTERM | Signal::SIGKILL) {
            self.process.exit(ExitInfo::signaled(signal));
        }
        Ok(())
    }
}

/// How mock processes report readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyMode {
    /// Each process reports ready as soon as it is spawned.
    Auto,
    /// Tests call [`MockProcess::ready`].
    Manual,
}

/// Mock spawner for testing.
pub struct MockSpawner {
    processes: Mutex<Vec<MockProcess>>,
    spawned: watch::Sender<usize>,
    next_pid: AtomicU32,
    ready_mode: ReadyMode,
    never_ready: Mutex<HashSet<WorkerId>>,
    fail_next: AtomicU32,
    responder: Option<Responder>,
}

impl Default for MockSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSpawner {
    /// Processes report ready on their own and answer queries with their pid.
    pub fn new() -> Self {
        Self::with_mode(ReadyMode::Auto)
    }

    /// Processes wait for [`MockProcess::ready`].
    pub fn manual() -> Self {
        Self::with_mode(ReadyMode::Manual)
    }

    fn with_mode(ready_mode: ReadyMode) -> Self {
        let responder: Responder = Arc::new(|request: &SpawnRequest, _query: &QueryRequest| {
            Some(json!({ "worker": request.worker.to_string() }))
        });
        Self {
            processes: Mutex::new(Vec::new()),
            spawned: watch::channel(0).0,
            next_pid: AtomicU32::new(1000),
            ready_mode,
            never_ready: Mutex::new(HashSet::new()),
            fail_next: AtomicU32::new(0),
            responder: Some(responder),
        }
    }

    /// Replace the query responder.
    pub fn with_responder(
        mut self,
        responder: impl Fn(&SpawnRequest, &QueryRequest) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Processes spawned for `worker` from now on never report ready,
    /// even in [`ReadyMode::Auto`].
    pub fn never_ready(&self, worker: WorkerId) {
        lock(&self.never_ready).insert(worker);
    }

    /// Let `worker` report ready again.
    pub fn allow_ready(&self, worker: WorkerId) {
        lock(&self.never_ready).remove(&worker);
    }

    /// Fail the next `count` spawn calls.
    pub fn fail_next_spawns(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Every process spawned so far, in spawn order.
    pub fn processes(&self) -> Vec<MockProcess> {
        lock(&self.processes).clone()
    }

    /// Processes spawned for `worker`, in spawn order.
    pub fn processes_for(&self, worker: WorkerId) -> Vec<MockProcess> {
        lock(&self.processes)
            .iter()
            .filter(|p| p.worker() == worker)
            .cloned()
            .collect()
    }

    /// Most recent process spawned for `worker`.
    pub fn latest(&self, worker: WorkerId) -> Option<MockProcess> {
        self.processes_for(worker).pop()
    }

    /// Process with `pid`.
    pub fn process(&self, pid: u32) -> Option<MockProcess> {
        lock(&self.processes)
            .iter()
            .find(|p| p.pid() == pid)
            .cloned()
    }

    /// Number of successful spawns.
    pub fn spawn_count(&self) -> usize {
        *self.spawned.borrow()
    }

    /// Wait until at least `count` processes have been spawned.
    pub async fn wait_for_spawns(&self, count: usize) {
        let mut rx = self.spawned.subscribe();
        let _ = rx.wait_for(|spawned| *spawned >= count).await;
    }
}

#[async_trait]
impl ProcessSpawner for MockSpawner {
    fn spawner_type(&self) -> &'static str {
        "mock"
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, SpawnError> {
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SpawnError::Other("mock spawn failure".to_string()));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let process = MockProcess {
            inner: Arc::new(MockProcessInner {
                pid,
                request: request.clone(),
                to_parent: message_tx,
                exit: Mutex::new(Some(exit_tx)),
                sent: Mutex::new(Vec::new()),
                signals: Mutex::new(Vec::new()),
                responder: self.responder.clone(),
            }),
        };

        let blocked = lock(&self.never_ready).contains(&request.worker);
        if self.ready_mode == ReadyMode::Auto && !blocked {
            process.ready();
        }

        lock(&self.processes).push(process.clone());
        self.spawned.send_modify(|count| *count += 1);

        Ok(SpawnedProcess {
            pid,
            control: Arc::new(MockControl { process }),
            messages: message_rx,
            exit: exit_rx,
        })
    }
}
