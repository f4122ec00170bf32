// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory registry of supervised workers.

use std::sync::Arc;

use dashmap::DashMap;

use crate::model::WorkerId;
use crate::worker::WorkerHandle;

/// Workers keyed by cluster id or process uuid.
///
/// Entries live until removed; nothing is evicted implicitly.
#[derive(Default, Clone)]
pub struct ProcessRegistry {
    workers: Arc<DashMap<WorkerId, Arc<WorkerHandle>>>,
}

impl ProcessRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a worker. Returns the previous handle.
    pub fn set(&self, handle: Arc<WorkerHandle>) -> Option<Arc<WorkerHandle>> {
        self.workers.insert(handle.id(), handle)
    }

    /// Remove a worker.
    pub fn remove(&self, id: &WorkerId) -> Option<Arc<WorkerHandle>> {
        self.workers.remove(id).map(|(_, handle)| handle)
    }

    /// Look up a worker.
    pub fn get(&self, id: &WorkerId) -> Option<Arc<WorkerHandle>> {
        self.workers.get(id).map(|entry| entry.value().clone())
    }

    /// True if `id` is registered.
    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    /// The worker owning `pid`, matching the current process or an in-flight
    /// replacement so exits racing a restart still resolve.
    pub fn find_by_pid(&self, pid: u32) -> Option<Arc<WorkerHandle>> {
        self.workers
            .iter()
            .find(|entry| entry.value().pid_role(pid).is_some())
            .map(|entry| entry.value().clone())
    }

    /// The worker running cluster `cluster_id`, whatever its registry key.
    pub fn find_cluster(&self, cluster_id: u32) -> Option<Arc<WorkerHandle>> {
        self.workers
            .iter()
            .find(|entry| {
                entry
                    .value()
                    .role()
                    .cluster()
                    .is_some_and(|spec| spec.id == cluster_id)
            })
            .map(|entry| entry.value().clone())
    }

    /// All workers, sorted by id.
    pub fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        let mut handles: Vec<_> = self
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        handles.sort_by_key(|handle| handle.id());
        handles
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True if no worker is registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::model::{ClusterSpec, ShardRange, WorkerRole};
    use crate::runner::MockSpawner;
    use crate::worker::WorkerContext;

    async fn handle(spawner: Arc<MockSpawner>, id: u32) -> Arc<WorkerHandle> {
        let (events, _) = mpsc::unbounded_channel();
        let context = WorkerContext {
            spawner,
            events,
            ready_timeout: Duration::from_secs(1),
        };
        let role = WorkerRole::Cluster(ClusterSpec::new(id, ShardRange::single(id, 8).unwrap(), 8));
        WorkerHandle::spawn(WorkerId::Cluster(id), role, None, context, false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let spawner = Arc::new(MockSpawner::new());
        let registry = ProcessRegistry::new();
        registry.set(handle(spawner.clone(), 2).await);
        registry.set(handle(spawner.clone(), 0).await);

        assert_eq!(registry.len(), 2);
        let ids: Vec<_> = registry.handles().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![WorkerId::Cluster(0), WorkerId::Cluster(2)]);

        assert!(registry.remove(&WorkerId::Cluster(0)).is_some());
        assert!(registry.get(&WorkerId::Cluster(0)).is_none());
        assert!(registry.contains(&WorkerId::Cluster(2)));
    }

    #[tokio::test]
    async fn test_find_by_pid_matches_replacement() {
        let spawner = Arc::new(MockSpawner::manual());
        let registry = ProcessRegistry::new();
        let worker = handle(spawner.clone(), 1).await;
        registry.set(worker.clone());

        let current = spawner.latest(WorkerId::Cluster(1)).unwrap();
        assert_eq!(
            registry.find_by_pid(current.pid()).map(|h| h.id()),
            Some(WorkerId::Cluster(1))
        );

        let restarting = worker.clone();
        let task = tokio::spawn(async move { restarting.restart(false).await });
        spawner.wait_for_spawns(2).await;
        let replacement = spawner.latest(WorkerId::Cluster(1)).unwrap();
        assert!(registry.find_by_pid(replacement.pid()).is_some());
        assert!(registry.find_by_pid(current.pid()).is_some());
        assert!(registry.find_by_pid(99_999).is_none());

        replacement.ready();
        task.await.unwrap().unwrap();
    }
}
