// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared data model: shard ranges, cluster specs, worker identities and the
//! environment contract handed to spawned workers.

use std::fmt;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::partition::PartitionError;

/// A contiguous, validated range of shard ids.
///
/// Invariant: `first_shard_id <= last_shard_id < shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawShardRange")]
pub struct ShardRange {
    first_shard_id: u32,
    last_shard_id: u32,
    shard_count: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawShardRange {
    first_shard_id: u32,
    last_shard_id: u32,
    shard_count: u32,
}

impl TryFrom<RawShardRange> for ShardRange {
    type Error = PartitionError;

    fn try_from(raw: RawShardRange) -> Result<Self, Self::Error> {
        ShardRange::new(raw.first_shard_id, raw.last_shard_id, raw.shard_count)
    }
}

impl ShardRange {
    /// Validate and build a range.
    pub fn new(first: u32, last: u32, shard_count: u32) -> Result<Self, PartitionError> {
        if first > last || last >= shard_count {
            return Err(PartitionError::InvalidRange {
                first,
                last,
                shard_count,
            });
        }
        Ok(Self {
            first_shard_id: first,
            last_shard_id: last,
            shard_count,
        })
    }

    /// A range holding one shard.
    pub fn single(shard_id: u32, shard_count: u32) -> Result<Self, PartitionError> {
        Self::new(shard_id, shard_id, shard_count)
    }

    /// Every shard, `[0, shard_count - 1]`.
    pub fn all(shard_count: u32) -> Result<Self, PartitionError> {
        if shard_count == 0 {
            return Err(PartitionError::InvalidArgument(
                "shard count must be positive".to_string(),
            ));
        }
        Self::new(0, shard_count - 1, shard_count)
    }

    /// First shard id.
    pub fn first_shard_id(&self) -> u32 {
        self.first_shard_id
    }

    /// Last shard id (inclusive).
    pub fn last_shard_id(&self) -> u32 {
        self.last_shard_id
    }

    /// Total shards in the fleet.
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Shard ids in this range.
    pub fn ids(&self) -> RangeInclusive<u32> {
        self.first_shard_id..=self.last_shard_id
    }

    /// Number of shards in this range.
    pub fn len(&self) -> u32 {
        self.last_shard_id - self.first_shard_id + 1
    }

    /// Always false; a range holds at least one shard.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for ShardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first_shard_id, self.last_shard_id)
    }
}

/// The host a cluster is assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRef {
    /// Short host name, e.g. `titan`.
    pub name: String,
    /// Resolvable host name for RPC.
    pub hostname: String,
    /// State (environment slot) the host serves.
    pub state: i32,
}

fn default_env() -> String {
    "dev".to_string()
}

/// One logical worker unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Unique within an environment.
    pub id: u32,
    /// Shards owned by this cluster.
    #[serde(flatten)]
    pub shards: ShardRange,
    /// Number of clusters in the fleet.
    pub cluster_count: u32,
    /// Assigned host (hosted topology only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostRef>,
    /// Bot application id the fleet belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Environment label.
    #[serde(default = "default_env")]
    pub env: String,
}

impl ClusterSpec {
    /// A spec without host assignment.
    pub fn new(id: u32, shards: ShardRange, cluster_count: u32) -> Self {
        Self {
            id,
            shards,
            cluster_count,
            host: None,
            client_id: None,
            env: default_env(),
        }
    }
}

/// Registry key of a supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerId {
    /// A cluster, keyed by its numeric id (direct topology).
    Cluster(u32),
    /// A process, keyed by its generated id (hosted topology).
    Process(Uuid),
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerId::Cluster(id) => write!(f, "{}", id),
            WorkerId::Process(id) => write!(f, "{}", id),
        }
    }
}

/// What a spawned process runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "cluster", rename_all = "camelCase")]
pub enum WorkerRole {
    /// A shard-owning cluster.
    Cluster(ClusterSpec),
    /// The cluster manager of the hosted topology.
    Manager,
}

impl WorkerRole {
    /// The cluster spec, for cluster roles.
    pub fn cluster(&self) -> Option<&ClusterSpec> {
        match self {
            WorkerRole::Cluster(spec) => Some(spec),
            WorkerRole::Manager => None,
        }
    }

    /// RPC port the process will listen on.
    pub fn port(&self, ports: PortMap) -> Option<u16> {
        match self {
            WorkerRole::Cluster(spec) => u16::try_from(spec.id)
                .ok()
                .and_then(|id| ports.worker_base.checked_add(id)),
            WorkerRole::Manager => Some(ports.manager),
        }
    }

    /// Short label for logs, e.g. `cluster 3 (shards 12-15)`.
    pub fn describe(&self) -> String {
        match self {
            WorkerRole::Cluster(spec) => format!("cluster {} (shards {})", spec.id, spec.shards),
            WorkerRole::Manager => "cluster manager".to_string(),
        }
    }
}

/// Fixed ports used to derive a process's RPC port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    /// Worker ports are this plus the cluster id.
    pub worker_base: u16,
    /// Cluster manager port.
    pub manager: u16,
}

impl Default for PortMap {
    fn default() -> Self {
        Self {
            worker_base: 30000,
            manager: 5052,
        }
    }
}

/// Everything a spawner needs to start one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Registry key.
    pub worker: WorkerId,
    /// What the process runs as.
    pub role: WorkerRole,
    /// Process record id, passed as `uuid`.
    pub uuid: Option<Uuid>,
    /// Ask the worker to report ready only once fully connected.
    pub await_ready: bool,
}

impl SpawnRequest {
    /// Environment variables describing this worker.
    ///
    /// Cluster workers get `id`, `clusterId`, `shardCount`, `firstShardId`,
    /// `lastShardId` and `clusterCount`; the manager role gets `manager`.
    /// Both get `awaitReady` and, when set, `uuid`.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(8);
        match &self.role {
            WorkerRole::Cluster(spec) => {
                env.push(("id".to_string(), spec.id.to_string()));
                env.push(("clusterId".to_string(), spec.id.to_string()));
                env.push((
                    "shardCount".to_string(),
                    spec.shards.shard_count().to_string(),
                ));
                env.push((
                    "firstShardId".to_string(),
                    spec.shards.first_shard_id().to_string(),
                ));
                env.push((
                    "lastShardId".to_string(),
                    spec.shards.last_shard_id().to_string(),
                ));
                env.push(("clusterCount".to_string(), spec.cluster_count.to_string()));
            }
            WorkerRole::Manager => {
                env.push(("manager".to_string(), "true".to_string()));
            }
        }
        env.push(("awaitReady".to_string(), self.await_ready.to_string()));
        if let Some(uuid) = self.uuid {
            env.push(("uuid".to_string(), uuid.to_string()));
        }
        env
    }
}

/// A process tracked by a host process manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    /// Generated process id.
    pub id: Uuid,
    /// OS pid of the live process.
    pub pid: Option<u32>,
    /// RPC port of the process.
    pub port: Option<u16>,
    /// What the process runs as.
    pub options: WorkerRole,
    /// When the live process was spawned.
    pub created_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// Cluster spec, when the process is a cluster.
    pub fn cluster(&self) -> Option<&ClusterSpec> {
        self.options.cluster()
    }
}
