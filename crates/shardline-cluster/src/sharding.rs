// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sharding strategies for the direct topology.
//!
//! | Strategy       | Clusters                           | Rollout                          |
//! |----------------|------------------------------------|----------------------------------|
//! | `process`      | one per shard                      | fixed delay, no ready wait       |
//! | `shared`       | one owning every shard             | single spawn                     |
//! | `balanced`     | shard range split into N clusters  | each awaited before the next     |
//! | `semibalanced` | as balanced                        | each awaited before the next     |
//!
//! The shard count comes from `SHARD_COUNT_OVERRIDE` or the gateway estimate.
//! If neither is available the rollout fails before spawning anything.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};
use crate::error::{Error, Result};
use crate::gateway::GatewayEstimator;
use crate::model::{ClusterSpec, ShardRange};
use crate::partition::{PartitionError, ShardCountEstimator, contiguous_chunks};
use crate::supervisor::Supervisor;

/// How shards are grouped into clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingStrategy {
    /// One cluster per shard, spawned at a fixed rate.
    Sequential,
    /// One cluster owning every shard.
    Shared,
    /// The shard range split into `CLUSTER_COUNT` contiguous clusters; the
    /// shard count is a multiple of the cluster count.
    Balanced,
    /// Same estimate, plan and rollout as balanced.
    SemiBalanced,
}

impl ShardingStrategy {
    /// Configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardingStrategy::Sequential => "process",
            ShardingStrategy::Shared => "shared",
            ShardingStrategy::Balanced => "balanced",
            ShardingStrategy::SemiBalanced => "semibalanced",
        }
    }

    /// Whether the shard count estimate rounds to the cluster count.
    pub fn balanced_estimate(&self) -> bool {
        matches!(self, ShardingStrategy::Balanced | ShardingStrategy::SemiBalanced)
    }
}

impl fmt::Display for ShardingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "sequential" => Ok(ShardingStrategy::Sequential),
            "shared" => Ok(ShardingStrategy::Shared),
            "balanced" => Ok(ShardingStrategy::Balanced),
            "semibalanced" | "semi-balanced" => Ok(ShardingStrategy::SemiBalanced),
            _ => Err(ConfigError::InvalidValue {
                var: "SHARDING_STRATEGY",
                value: s.to_string(),
            }),
        }
    }
}

/// One cluster per shard, in increasing shard id order, optionally limited
/// to `allow`.
pub fn plan_sequential(
    shard_count: u32,
    allow: Option<&[u32]>,
) -> std::result::Result<Vec<ClusterSpec>, PartitionError> {
    (0..shard_count)
        .filter(|id| allow.is_none_or(|allow| allow.contains(id)))
        .map(|id| ShardRange::single(id, shard_count).map(|shards| ClusterSpec::new(id, shards, shard_count)))
        .collect()
}

/// One cluster owning every shard.
pub fn plan_shared(shard_count: u32) -> std::result::Result<Vec<ClusterSpec>, PartitionError> {
    Ok(vec![ClusterSpec::new(0, ShardRange::all(shard_count)?, 1)])
}

/// Split `[first, last]` into `cluster_count` contiguous clusters.
///
/// `first` defaults to 0 and `last` to `shard_count - 1`. Cluster ids are
/// chunk indices, so orchestrators sharing one range with different
/// `allow` lists agree on numbering. Empty chunks are skipped.
pub fn plan_balanced(
    shard_count: u32,
    cluster_count: u32,
    first: Option<u32>,
    last: Option<u32>,
    allow: Option<&[u32]>,
) -> std::result::Result<Vec<ClusterSpec>, PartitionError> {
    let first = first.unwrap_or(0);
    let last = match last {
        Some(last) => last,
        None => shard_count.checked_sub(1).ok_or_else(|| {
            PartitionError::InvalidArgument("shard count must be positive".to_string())
        })?,
    };
    let owned = ShardRange::new(first, last, shard_count)?;
    let shard_ids: Vec<u32> = owned.ids().collect();

    let mut clusters = Vec::new();
    for (index, chunk) in contiguous_chunks(&shard_ids, cluster_count as usize)?
        .into_iter()
        .enumerate()
    {
        let (Some(&chunk_first), Some(&chunk_last)) = (chunk.first(), chunk.last()) else {
            continue;
        };
        let id = index as u32;
        if allow.is_some_and(|allow| !allow.contains(&id)) {
            continue;
        }
        clusters.push(ClusterSpec::new(
            id,
            ShardRange::new(chunk_first, chunk_last, shard_count)?,
            cluster_count,
        ));
    }
    Ok(clusters)
}

/// Outcome of a strategy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutReport {
    /// Strategy used.
    pub strategy: ShardingStrategy,
    /// Fleet shard count.
    pub shard_count: u32,
    /// Clusters spawned, in order.
    pub spawned: Vec<u32>,
    /// Clusters that failed to spawn or never reported ready.
    pub failed: Vec<(u32, String)>,
}

/// Runs a sharding strategy against a supervisor.
pub struct Sharding {
    strategy: ShardingStrategy,
    config: Config,
    gateway: Arc<dyn GatewayEstimator>,
    estimator: ShardCountEstimator,
}

impl Sharding {
    /// Sharding with the strategy named in `config`.
    pub fn new(config: Config, gateway: Arc<dyn GatewayEstimator>) -> Self {
        Self {
            strategy: config.strategy,
            config,
            gateway,
            estimator: ShardCountEstimator::new(),
        }
    }

    /// Override the strategy.
    pub fn with_strategy(mut self, strategy: ShardingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Selected strategy.
    pub fn strategy(&self) -> ShardingStrategy {
        self.strategy
    }

    /// Fleet shard count: the override when set, the gateway estimate
    /// otherwise.
    pub async fn shard_count(&self) -> Result<u32> {
        if let Some(count) = self.config.shard_count_override {
            return Ok(count);
        }
        let guilds = self.gateway.estimated_guilds().await?;
        let count = self.estimator.estimate(
            guilds,
            self.strategy.balanced_estimate(),
            self.config.cluster_count,
        );
        info!(guilds, shard_count = count, "Estimated shard count");
        Ok(count)
    }

    /// Clusters the strategy would spawn for `shard_count`.
    pub fn plan(&self, shard_count: u32) -> Result<Vec<ClusterSpec>> {
        let plan = match self.strategy {
            ShardingStrategy::Sequential => {
                plan_sequential(shard_count, self.config.shard_ids.as_deref())?
            }
            ShardingStrategy::Shared => plan_shared(shard_count)?,
            ShardingStrategy::Balanced | ShardingStrategy::SemiBalanced => plan_balanced(
                shard_count,
                self.config.cluster_count,
                self.config.first_shard_override,
                self.config.last_shard_override,
                self.config.cluster_ids.as_deref(),
            )?,
        };
        Ok(plan)
    }

    /// Compute the plan and spawn it through `supervisor`.
    pub async fn run(&self, supervisor: &Supervisor) -> Result<RolloutReport> {
        let shard_count = self.shard_count().await.inspect_err(|e| {
            error!(strategy = %self.strategy, error = %e, "Unable to determine shard count");
        })?;
        let plan = self.plan(shard_count)?;

        info!(
            strategy = %self.strategy,
            shard_count,
            clusters = plan.len(),
            "Starting with {} shards in {} clusters",
            plan.iter().map(|spec| spec.shards.len()).sum::<u32>(),
            plan.len()
        );

        let mut report = RolloutReport {
            strategy: self.strategy,
            shard_count,
            spawned: Vec::with_capacity(plan.len()),
            failed: Vec::new(),
        };

        let total = plan.len();
        for (index, spec) in plan.into_iter().enumerate() {
            if supervisor.is_stopping() {
                break;
            }
            let id = spec.id;
            match self.strategy {
                ShardingStrategy::Sequential => {
                    self.spawn_unawaited(supervisor, spec, &mut report).await;
                    if index + 1 < total {
                        tokio::time::sleep(self.config.shard_spawn_delay).await;
                    }
                }
                ShardingStrategy::Shared => {
                    self.spawn_unawaited(supervisor, spec, &mut report).await;
                }
                ShardingStrategy::Balanced | ShardingStrategy::SemiBalanced => {
                    self.spawn_awaited(supervisor, spec, supervisor.config().ready_timeout, &mut report)
                        .await;
                }
            }
            if report.spawned.last() == Some(&id) {
                info!(cluster_id = id, "Cluster created");
            }
        }

        Ok(report)
    }

    async fn spawn_unawaited(&self, supervisor: &Supervisor, spec: ClusterSpec, report: &mut RolloutReport) {
        let id = spec.id;
        match supervisor.spawn_cluster(spec, false).await {
            Ok(_) => report.spawned.push(id),
            Err(e) => {
                error!(cluster_id = id, error = %e, "Failed to spawn cluster");
                report.failed.push((id, e.to_string()));
            }
        }
    }

    async fn spawn_awaited(
        &self,
        supervisor: &Supervisor,
        spec: ClusterSpec,
        timeout: Duration,
        report: &mut RolloutReport,
    ) {
        let id = spec.id;
        let handle = match supervisor.spawn_cluster(spec, false).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(cluster_id = id, error = %e, "Failed to spawn cluster");
                report.failed.push((id, e.to_string()));
                return;
            }
        };
        report.spawned.push(id);

        if let Err(e) = handle.wait_ready(timeout).await {
            warn!(cluster_id = id, error = %e, "Cluster not ready, continuing rollout");
            report.failed.push((id, e.to_string()));
        }
    }
}

impl Sharding {
    /// Rollout with errors mapped for callers that only log them.
    pub async fn run_logged(&self, supervisor: &Supervisor) -> Option<RolloutReport> {
        match self.run(supervisor).await {
            Ok(report) => Some(report),
            Err(Error::ShardCountUnavailable(reason)) => {
                error!(reason = %reason, "Shard count unavailable, no clusters spawned");
                None
            }
            Err(e) => {
                error!(error = %e, "Sharding failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(plan: &[ClusterSpec]) -> Vec<(u32, u32, u32)> {
        plan.iter()
            .map(|c| (c.id, c.shards.first_shard_id(), c.shards.last_shard_id()))
            .collect()
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!("process".parse::<ShardingStrategy>().unwrap(), ShardingStrategy::Sequential);
        assert_eq!("Shared".parse::<ShardingStrategy>().unwrap(), ShardingStrategy::Shared);
        assert_eq!("balanced".parse::<ShardingStrategy>().unwrap(), ShardingStrategy::Balanced);
        assert_eq!(
            "semibalanced".parse::<ShardingStrategy>().unwrap(),
            ShardingStrategy::SemiBalanced
        );
        assert!(matches!(
            "random".parse::<ShardingStrategy>(),
            Err(ConfigError::InvalidValue { var: "SHARDING_STRATEGY", .. })
        ));
    }

    #[test]
    fn test_plan_sequential() {
        let plan = plan_sequential(4, None).unwrap();
        assert_eq!(ranges(&plan), vec![(0, 0, 0), (1, 1, 1), (2, 2, 2), (3, 3, 3)]);
        assert!(plan.iter().all(|c| c.shards.shard_count() == 4));

        let plan = plan_sequential(4, Some(&[3, 1])).unwrap();
        assert_eq!(ranges(&plan), vec![(1, 1, 1), (3, 3, 3)]);
    }

    #[test]
    fn test_plan_shared() {
        let plan = plan_shared(16).unwrap();
        assert_eq!(ranges(&plan), vec![(0, 0, 15)]);
        assert_eq!(plan[0].cluster_count, 1);
        assert!(plan_shared(0).is_err());
    }

    #[test]
    fn test_plan_balanced_two_hosts() {
        let plan = plan_balanced(4, 2, Some(0), Some(3), None).unwrap();
        assert_eq!(ranges(&plan), vec![(0, 0, 1), (1, 2, 3)]);
        assert!(plan.iter().all(|c| c.cluster_count == 2));
    }

    #[test]
    fn test_plan_balanced_partial_range_and_allow_list() {
        let plan = plan_balanced(32, 3, Some(16), Some(25), None).unwrap();
        assert_eq!(ranges(&plan), vec![(0, 16, 19), (1, 20, 22), (2, 23, 25)]);

        let plan = plan_balanced(32, 3, Some(16), Some(25), Some(&[1])).unwrap();
        assert_eq!(ranges(&plan), vec![(1, 20, 22)]);
    }

    #[test]
    fn test_plan_balanced_more_clusters_than_shards() {
        let plan = plan_balanced(2, 4, None, None, None).unwrap();
        assert_eq!(ranges(&plan), vec![(0, 0, 0), (1, 1, 1)]);
    }

    #[test]
    fn test_plan_balanced_rejects_bad_range() {
        assert!(plan_balanced(8, 2, Some(6), Some(9), None).is_err());
        assert!(plan_balanced(0, 2, None, None, None).is_err());
    }
}
