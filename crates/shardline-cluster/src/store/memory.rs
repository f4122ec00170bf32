// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory cluster store for development and tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{ClusterStore, HostRecord, cluster_state};
use crate::error::{Error, Result};
use crate::model::{ClusterSpec, HostRef};

#[derive(Default)]
struct Tables {
    clusters: BTreeMap<(i32, u32), ClusterSpec>,
    hosts: BTreeMap<String, HostRecord>,
}

/// Cluster store kept in process memory.
#[derive(Default)]
pub struct MemoryClusterStore {
    tables: Mutex<Tables>,
}

impl MemoryClusterStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn find_clusters(&self, state: i32) -> Result<Vec<ClusterSpec>> {
        Ok(self
            .tables()
            .clusters
            .range((state, 0)..=(state, u32::MAX))
            .map(|(_, spec)| spec.clone())
            .collect())
    }

    async fn find_cluster(&self, state: i32, id: u32) -> Result<Option<ClusterSpec>> {
        Ok(self.tables().clusters.get(&(state, id)).cloned())
    }

    async fn insert_clusters(&self, clusters: &[ClusterSpec]) -> Result<()> {
        let keyed = clusters
            .iter()
            .map(|spec| Ok(((cluster_state(spec)?, spec.id), spec.clone())))
            .collect::<Result<Vec<_>>>()?;

        let mut tables = self.tables();
        if let Some((key, _)) = keyed.iter().find(|(key, _)| tables.clusters.contains_key(key)) {
            return Err(Error::InvalidRecord(format!(
                "cluster {} already exists in state {}",
                key.1, key.0
            )));
        }
        tables.clusters.extend(keyed);
        Ok(())
    }

    async fn update_cluster_host(&self, state: i32, id: u32, host: &HostRef) -> Result<bool> {
        let mut tables = self.tables();
        let Some(mut spec) = tables.clusters.remove(&(state, id)) else {
            return Ok(false);
        };
        spec.host = Some(host.clone());
        tables.clusters.insert((host.state, id), spec);
        Ok(true)
    }

    async fn delete_clusters(&self, states: &[i32]) -> Result<u64> {
        let mut tables = self.tables();
        let before = tables.clusters.len();
        tables
            .clusters
            .retain(|(state, _), _| !states.contains(state));
        Ok((before - tables.clusters.len()) as u64)
    }

    async fn find_host(&self, name: &str) -> Result<Option<HostRecord>> {
        Ok(self.tables().hosts.get(name).cloned())
    }

    async fn find_hosts(&self, client_id: &str) -> Result<Vec<HostRecord>> {
        let mut hosts: Vec<HostRecord> = self
            .tables()
            .hosts
            .values()
            .filter(|host| host.client_id.as_deref() == Some(client_id))
            .cloned()
            .collect();
        hosts.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
        Ok(hosts)
    }

    async fn upsert_host(&self, host: &HostRecord) -> Result<()> {
        self.tables().hosts.insert(host.name.clone(), host.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShardRange;

    fn host(name: &str, state: i32, position: i32) -> HostRecord {
        HostRecord {
            name: name.to_string(),
            hostname: format!("{}.lan", name),
            state,
            client_id: Some("app".to_string()),
            position,
        }
    }

    fn cluster(id: u32, host: &HostRecord) -> ClusterSpec {
        let mut spec = ClusterSpec::new(id, ShardRange::single(id, 8).unwrap(), 8);
        spec.host = Some(host.host_ref());
        spec
    }

    #[tokio::test]
    async fn test_clusters_partitioned_by_state() {
        let store = MemoryClusterStore::new();
        let titan = host("titan", 1, 0);
        let atlas = host("atlas", 2, 1);
        store
            .insert_clusters(&[cluster(1, &titan), cluster(0, &titan), cluster(2, &atlas)])
            .await
            .unwrap();

        let ids: Vec<u32> = store
            .find_clusters(1)
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![0, 1]);
        assert!(store.find_cluster(1, 2).await.unwrap().is_none());
        assert!(store.find_cluster(2, 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_insert_requires_host_and_unique_key() {
        let store = MemoryClusterStore::new();
        let bare = ClusterSpec::new(0, ShardRange::single(0, 1).unwrap(), 1);
        assert!(matches!(
            store.insert_clusters(&[bare]).await,
            Err(Error::InvalidRecord(_))
        ));

        let titan = host("titan", 1, 0);
        store.insert_clusters(&[cluster(0, &titan)]).await.unwrap();
        assert!(store.insert_clusters(&[cluster(0, &titan)]).await.is_err());
    }

    #[tokio::test]
    async fn test_move_changes_state() {
        let store = MemoryClusterStore::new();
        let titan = host("titan", 1, 0);
        let atlas = host("atlas", 2, 1);
        store.insert_clusters(&[cluster(3, &titan)]).await.unwrap();

        assert!(store.update_cluster_host(1, 3, &atlas.host_ref()).await.unwrap());
        assert!(!store.update_cluster_host(1, 3, &atlas.host_ref()).await.unwrap());
        let moved = store.find_cluster(2, 3).await.unwrap().unwrap();
        assert_eq!(moved.host.unwrap().name, "atlas");
    }

    #[tokio::test]
    async fn test_delete_and_hosts() {
        let store = MemoryClusterStore::new();
        let titan = host("titan", 1, 1);
        let atlas = host("atlas", 2, 0);
        store.upsert_host(&titan).await.unwrap();
        store.upsert_host(&atlas).await.unwrap();
        store
            .insert_clusters(&[cluster(0, &titan), cluster(1, &atlas)])
            .await
            .unwrap();

        assert_eq!(store.delete_clusters(&[1]).await.unwrap(), 1);
        assert!(store.find_clusters(1).await.unwrap().is_empty());

        let names: Vec<String> = store
            .find_hosts("app")
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.name)
            .collect();
        assert_eq!(names, vec!["atlas", "titan"]);
        assert_eq!(store.find_host("titan").await.unwrap(), Some(titan));
        assert!(store.find_host("nope").await.unwrap().is_none());
    }
}
