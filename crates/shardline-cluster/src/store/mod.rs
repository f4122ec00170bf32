// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster store: where hosted clusters and their hosts are recorded.
//!
//! Clusters are partitioned by the state of the host they are assigned to;
//! a cluster manager only ever reads the clusters of its own state.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryClusterStore;
pub use self::postgres::PostgresClusterStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{ClusterSpec, HostRef};

/// A host clusters can be assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    /// Short host name.
    pub name: String,
    /// Resolvable host name.
    pub hostname: String,
    /// State the host serves.
    pub state: i32,
    /// Bot application the host belongs to.
    pub client_id: Option<String>,
    /// Order of the host within its client's fleet.
    pub position: i32,
}

impl HostRecord {
    /// Reference embedded in cluster specs.
    pub fn host_ref(&self) -> HostRef {
        HostRef {
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            state: self.state,
        }
    }
}

/// Storage of cluster assignments and hosts.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Clusters assigned to hosts of `state`, ordered by id.
    async fn find_clusters(&self, state: i32) -> Result<Vec<ClusterSpec>>;

    /// One cluster of `state`.
    async fn find_cluster(&self, state: i32, id: u32) -> Result<Option<ClusterSpec>>;

    /// Insert clusters. Every cluster must carry a host.
    async fn insert_clusters(&self, clusters: &[ClusterSpec]) -> Result<()>;

    /// Reassign cluster `id` of `state` to `host`. Returns false when no
    /// such cluster exists.
    async fn update_cluster_host(&self, state: i32, id: u32, host: &HostRef) -> Result<bool>;

    /// Delete every cluster of the given states. Returns how many were removed.
    async fn delete_clusters(&self, states: &[i32]) -> Result<u64>;

    /// Host by name.
    async fn find_host(&self, name: &str) -> Result<Option<HostRecord>>;

    /// Hosts of a client, in fleet order.
    async fn find_hosts(&self, client_id: &str) -> Result<Vec<HostRecord>>;

    /// Insert or update a host.
    async fn upsert_host(&self, host: &HostRecord) -> Result<()>;
}

/// State key of a cluster to be stored.
fn cluster_state(spec: &ClusterSpec) -> Result<i32> {
    spec.host
        .as_ref()
        .map(|host| host.state)
        .ok_or_else(|| {
            crate::error::Error::InvalidRecord(format!("cluster {} has no host", spec.id))
        })
}
