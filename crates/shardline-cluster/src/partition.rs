// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partitioning: splitting shard ids into clusters and clusters into hosts.
//!
//! Everything here is pure. [`ShardCountEstimator`] keeps the last result so
//! the shard count never shrinks within a process lifetime.

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::model::{ClusterSpec, HostRef, ShardRange};

/// Guild estimates are clamped to at least this many.
pub const MIN_ESTIMATED_GUILDS: u64 = 2500;

/// Target guilds per shard.
pub const GUILDS_PER_SHARD: f64 = 1400.0;

/// Partitioning errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    /// Input cannot be partitioned (no items, zero chunks).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Shard range violates `first <= last < shard_count`.
    #[error("Invalid shard range {first}-{last} for {shard_count} shards")]
    InvalidRange {
        /// First shard id.
        first: u32,
        /// Last shard id.
        last: u32,
        /// Fleet shard count.
        shard_count: u32,
    },
}

/// Split `items` into exactly `chunk_count` contiguous chunks.
///
/// Chunk sizes are `len / chunk_count` or one more; the first
/// `len % chunk_count` chunks get the extra item. When `chunk_count`
/// exceeds `len` the trailing chunks are empty.
pub fn contiguous_chunks<T: Clone>(
    items: &[T],
    chunk_count: usize,
) -> Result<Vec<Vec<T>>, PartitionError> {
    if chunk_count == 0 {
        return Err(PartitionError::InvalidArgument(
            "chunk count must be positive".to_string(),
        ));
    }
    if items.is_empty() {
        return Err(PartitionError::InvalidArgument(
            "cannot partition an empty sequence".to_string(),
        ));
    }

    let base = items.len() / chunk_count;
    let remainder = items.len() % chunk_count;
    let mut chunks = Vec::with_capacity(chunk_count);
    let mut start = 0;

    for index in 0..chunk_count {
        let size = base + usize::from(index < remainder);
        chunks.push(items[start..start + size].to_vec());
        start += size;
    }

    Ok(chunks)
}

/// One step of the shard count estimate.
///
/// Guilds are clamped to [`MIN_ESTIMATED_GUILDS`], rounded up to a multiple
/// of 2500, divided by [`GUILDS_PER_SHARD`] and rounded. The result is then
/// rounded up to a multiple of `host_count` (balanced) or 2, and never drops
/// below `previous`.
pub fn estimate_shard_count(
    estimated_guilds: u64,
    balanced: bool,
    host_count: u32,
    previous: u32,
) -> u32 {
    let guilds = estimated_guilds.max(MIN_ESTIMATED_GUILDS);
    let rounded_guilds = guilds.div_ceil(MIN_ESTIMATED_GUILDS) * MIN_ESTIMATED_GUILDS;
    let shard_calc = (rounded_guilds as f64 / GUILDS_PER_SHARD).round() as u32;
    let n = if balanced { host_count.max(1) } else { 2 };
    previous.max(n * shard_calc.div_ceil(n))
}

/// Monotonic shard count estimate.
#[derive(Debug, Default)]
pub struct ShardCountEstimator {
    previous: AtomicU32,
}

impl ShardCountEstimator {
    /// Start from zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known shard count.
    pub fn with_previous(previous: u32) -> Self {
        Self {
            previous: AtomicU32::new(previous),
        }
    }

    /// Estimate and remember the result.
    pub fn estimate(&self, estimated_guilds: u64, balanced: bool, host_count: u32) -> u32 {
        let previous = self.previous.load(Ordering::Acquire);
        let estimate = estimate_shard_count(estimated_guilds, balanced, host_count, previous);
        let prior = self.previous.fetch_max(estimate, Ordering::AcqRel);
        prior.max(estimate)
    }

    /// Last estimate (0 before the first call).
    pub fn current(&self) -> u32 {
        self.previous.load(Ordering::Acquire)
    }
}

/// Lay out a fleet across hosts.
///
/// Shard ids `0..shard_count` are chunked into `cluster_count` clusters, the
/// clusters are chunked into one group per host, group *i* is assigned to
/// `hosts[i]`, and clusters are numbered globally from 0.
pub fn provision_clusters(
    shard_count: u32,
    cluster_count: u32,
    hosts: &[HostRef],
    client_id: Option<&str>,
    env: &str,
) -> Result<Vec<ClusterSpec>, PartitionError> {
    if hosts.is_empty() {
        return Err(PartitionError::InvalidArgument(
            "at least one host is required".to_string(),
        ));
    }

    let shard_ids: Vec<u32> = (0..shard_count).collect();
    let shard_chunks: Vec<Vec<u32>> = contiguous_chunks(&shard_ids, cluster_count as usize)?
        .into_iter()
        .filter(|chunk| !chunk.is_empty())
        .collect();
    let actual_cluster_count = shard_chunks.len() as u32;
    let groups = contiguous_chunks(&shard_chunks, hosts.len())?;

    let mut clusters = Vec::with_capacity(shard_chunks.len());
    for (host, group) in hosts.iter().zip(groups) {
        for chunk in group {
            let (Some(&first), Some(&last)) = (chunk.first(), chunk.last()) else {
                continue;
            };
            clusters.push(ClusterSpec {
                id: clusters.len() as u32,
                shards: ShardRange::new(first, last, shard_count)?,
                cluster_count: actual_cluster_count,
                host: Some(host.clone()),
                client_id: client_id.map(str::to_string),
                env: env.to_string(),
            });
        }
    }

    Ok(clusters)
}
