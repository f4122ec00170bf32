// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Types returned by the management SDK.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One worker's answer to an aggregated diagnostic query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAnswer {
    /// Cluster id, or the process id of non-cluster workers.
    pub id: Value,
    /// Answer, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error text, on failure or timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerAnswer {
    /// True when the worker answered.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Which clusters a restart targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTarget {
    /// Every cluster, one at a time.
    All,
    /// One cluster.
    Cluster(u32),
}

impl RestartTarget {
    /// Wire form of the target.
    pub fn to_value(self) -> Value {
        match self {
            RestartTarget::All => Value::from("all"),
            RestartTarget::Cluster(id) => Value::from(id),
        }
    }
}

impl std::str::FromStr for RestartTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(RestartTarget::All);
        }
        s.parse()
            .map(RestartTarget::Cluster)
            .map_err(|_| format!("Invalid cluster id: {}", s))
    }
}

/// A process tracked by a host process manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    /// Process record id.
    pub id: String,
    /// OS pid of the live process.
    #[serde(default)]
    pub pid: Option<u32>,
    /// RPC port of the process.
    #[serde(default)]
    pub port: Option<u16>,
    /// What the process runs as: `{"role": "cluster", "cluster": {...}}`
    /// or `{"role": "manager"}`.
    pub options: Value,
    /// When the live process was spawned.
    pub created_at: DateTime<Utc>,
}

impl ProcessInfo {
    /// Cluster id, when the process is a cluster.
    pub fn cluster_id(&self) -> Option<u32> {
        self.options
            .get("cluster")?
            .get("id")?
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
    }
}
