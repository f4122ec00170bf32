// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for shardline-cluster integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shardline_cluster::fan_in::WorkerNotice;
use shardline_cluster::model::{ClusterSpec, ShardRange, WorkerId};
use shardline_cluster::runner::{ExitInfo, MockSpawner};
use shardline_cluster::supervisor::{LifecycleObserver, Supervisor, SupervisorConfig};
use shardline_cluster::worker::WorkerHandle;

/// Cluster `id` owning shard `id` of `shard_count`.
pub fn spec(id: u32, shard_count: u32) -> ClusterSpec {
    ClusterSpec::new(id, ShardRange::single(id, shard_count).unwrap(), shard_count)
}

/// Short timeouts for tests.
pub fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        ready_timeout: Duration::from_secs(2),
        restart_retry_delay: Duration::from_millis(20),
        aggregate_timeout: Duration::from_millis(200),
    }
}

/// What a [`RecordingObserver`] saw.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Exit(WorkerId, ExitInfo),
    Recovered(WorkerId, u32),
    Notice(WorkerId, WorkerNotice),
}

/// Observer that keeps every callback.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LifecycleObserver for RecordingObserver {
    async fn unexpected_exit(&self, handle: &WorkerHandle, exit: ExitInfo) {
        self.events.lock().unwrap().push(Observed::Exit(handle.id(), exit));
    }

    async fn recovered(&self, handle: &WorkerHandle, pid: u32) {
        self.events.lock().unwrap().push(Observed::Recovered(handle.id(), pid));
    }

    async fn notice(&self, handle: &WorkerHandle, notice: WorkerNotice) {
        self.events.lock().unwrap().push(Observed::Notice(handle.id(), notice));
    }
}

/// Supervisor over a mock spawner with its event loop running.
pub fn running_supervisor(
    spawner: Arc<MockSpawner>,
    observer: Arc<RecordingObserver>,
) -> Arc<Supervisor> {
    let supervisor = Supervisor::new(spawner, supervisor_config(), observer);
    tokio::spawn(supervisor.clone().run());
    supervisor
}

/// Poll `condition` until it holds, failing after two seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Skip a test when `TEST_DATABASE_URL` is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
