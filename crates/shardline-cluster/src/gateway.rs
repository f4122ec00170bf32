// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gateway shard recommendation.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Each recommended shard stands for roughly this many guilds.
pub const GUILDS_PER_RECOMMENDED_SHARD: u64 = 1000;

/// Source of the upstream shard recommendation.
///
/// Implementations do not retry; a failure is reported to the caller.
#[async_trait]
pub trait GatewayEstimator: Send + Sync {
    /// Shard count recommended by the gateway.
    async fn recommended_shard_count(&self) -> Result<u32>;

    /// Guild count implied by the recommendation.
    async fn estimated_guilds(&self) -> Result<u64> {
        let shards = self.recommended_shard_count().await?;
        Ok(u64::from(shards) * GUILDS_PER_RECOMMENDED_SHARD)
    }
}

#[derive(Debug, Deserialize)]
struct GatewayBot {
    shards: u32,
}

/// Asks the Discord REST API (`GET /gateway/bot`).
#[derive(Debug, Clone)]
pub struct DiscordGateway {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl DiscordGateway {
    /// Client for `base_url` authenticating with a bot token.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl GatewayEstimator for DiscordGateway {
    async fn recommended_shard_count(&self) -> Result<u32> {
        let url = format!("{}/gateway/bot", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .map_err(|e| Error::ShardCountUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ShardCountUnavailable(format!(
                "gateway returned {}",
                status
            )));
        }

        let body: GatewayBot = response
            .json()
            .await
            .map_err(|e| Error::ShardCountUnavailable(e.to_string()))?;

        debug!(shards = body.shards, "Gateway shard recommendation");
        Ok(body.shards)
    }
}

/// Fixed recommendation, for development and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedShardCount(pub u32);

#[async_trait]
impl GatewayEstimator for FixedShardCount {
    async fn recommended_shard_count(&self) -> Result<u32> {
        Ok(self.0)
    }
}

/// Always fails, as if the gateway were unreachable.
#[derive(Debug, Clone, Default)]
pub struct UnavailableGateway;

#[async_trait]
impl GatewayEstimator for UnavailableGateway {
    async fn recommended_shard_count(&self) -> Result<u32> {
        Err(Error::ShardCountUnavailable(
            "no gateway configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_estimate() {
        let gateway = FixedShardCount(16);
        assert_eq!(gateway.recommended_shard_count().await.unwrap(), 16);
        assert_eq!(gateway.estimated_guilds().await.unwrap(), 16_000);
    }

    #[tokio::test]
    async fn test_unavailable_gateway() {
        let err = UnavailableGateway.estimated_guilds().await.unwrap_err();
        assert!(matches!(err, Error::ShardCountUnavailable(_)));
    }

    #[test]
    fn test_base_url_trimmed() {
        let gateway = DiscordGateway::new("https://discord.com/api/v10/", "t");
        assert_eq!(gateway.base_url, "https://discord.com/api/v10");
    }
}
