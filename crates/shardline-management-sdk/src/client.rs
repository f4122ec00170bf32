// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ManagementSdk client for interacting with a shardline fleet.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use shardline_protocol::{RpcClient, RpcClientConfig};
use tracing::{debug, info, instrument};

use crate::config::SdkConfig;
use crate::error::{Result, SdkError};
use crate::types::{ProcessInfo, RestartTarget, WorkerAnswer};

/// High-level SDK for operating a shardline fleet.
///
/// Three servers are reachable from one SDK:
/// - the control HTTP server of a direct-topology orchestrator
/// - the cluster manager RPC server of a hosted fleet
/// - the process manager RPC server of one host
pub struct ManagementSdk {
    http: reqwest::Client,
    manager: RpcClient,
    processes: RpcClient,
    config: SdkConfig,
}

impl ManagementSdk {
    /// Create a new SDK with the given configuration.
    pub fn new(config: SdkConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let manager = RpcClient::with_config(
            RpcClientConfig::new(config.rpc_host.clone(), config.manager_port)
                .with_timeout(config.request_timeout),
        )?;
        let processes = RpcClient::with_config(
            RpcClientConfig::new(config.rpc_host.clone(), config.process_manager_port)
                .with_timeout(config.request_timeout),
        )?;

        Ok(Self {
            http,
            manager,
            processes,
            config,
        })
    }

    /// Create an SDK from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(SdkConfig::from_env()?)
    }

    /// Get the SDK configuration.
    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn control_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.control_url.trim_end_matches('/'), path)
    }

    /// Send a control request and return the body of a successful reply.
    async fn control(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<String> {
        let url = self.control_url(path);
        debug!(%url, "Control request");

        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.body(serde_json::to_string(&body)?);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        match status {
            s if s.is_success() => Ok(text),
            StatusCode::FORBIDDEN => Err(SdkError::Unauthorized(text)),
            StatusCode::NOT_FOUND => Err(SdkError::NotFound(text)),
            s => Err(SdkError::Http {
                status: s.as_u16(),
                body: text,
            }),
        }
    }

    async fn control_json<T: DeserializeOwned>(&self, method: reqwest::Method, path: &str) -> Result<T> {
        let text = self.control(method, path, None).await?;
        Ok(serde_json::from_str(&text)?)
    }

    fn restart_token(&self) -> Result<&str> {
        self.config
            .restart_token
            .as_deref()
            .ok_or_else(|| SdkError::Config("RESTART_TOKEN is not set".to_string()))
    }

    fn rpc_token(&self) -> Result<&str> {
        self.config
            .rpc_token
            .as_deref()
            .ok_or_else(|| SdkError::Config("RPC_TOKEN is not set".to_string()))
    }

    // =========================================================================
    // Control server
    // =========================================================================

    /// Liveness check of the control server.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<String> {
        self.control(reqwest::Method::GET, "ping", None).await
    }

    /// Shard status of every cluster.
    #[instrument(skip(self))]
    pub async fn shards(&self) -> Result<Vec<WorkerAnswer>> {
        self.control_json(reqwest::Method::GET, "shards").await
    }

    /// Ping every worker through its supervisor.
    #[instrument(skip(self))]
    pub async fn ping_workers(&self) -> Result<Vec<WorkerAnswer>> {
        self.control_json(reqwest::Method::POST, "ping").await
    }

    /// Restart one cluster, or every cluster one at a time.
    #[instrument(skip(self))]
    pub async fn restart(&self, target: RestartTarget) -> Result<()> {
        let body = json!({ "id": target.to_value(), "token": self.restart_token()? });
        self.control(reqwest::Method::POST, "restart", Some(body)).await?;
        info!(?target, "Restart accepted");
        Ok(())
    }

    /// Broadcast a guild update to every worker.
    #[instrument(skip(self, payload))]
    pub async fn guild_update(&self, payload: Value) -> Result<()> {
        self.control(reqwest::Method::POST, "guildUpdate", Some(payload))
            .await
            .map(|_| ())
    }

    /// Broadcast stats to every worker.
    #[instrument(skip(self, payload))]
    pub async fn post_stats(&self, payload: Value) -> Result<()> {
        self.control(reqwest::Method::POST, "stats", Some(payload))
            .await
            .map(|_| ())
    }

    /// Reload a named module of the orchestrator.
    #[instrument(skip(self))]
    pub async fn reload(&self, module: &str) -> Result<()> {
        if module.is_empty() {
            return Err(SdkError::InvalidInput("module name is empty".to_string()));
        }
        self.control(reqwest::Method::POST, "reload", Some(json!({ "c": module })))
            .await
            .map(|_| ())
    }

    // =========================================================================
    // Cluster manager
    // =========================================================================

    /// Restart through the cluster manager.
    ///
    /// A single cluster restart waits for readiness and returns the new
    /// process record; `All` returns as soon as the restarts are queued.
    #[instrument(skip(self))]
    pub async fn manager_restart(&self, target: RestartTarget) -> Result<Value> {
        let params = json!({ "id": target.to_value(), "token": self.rpc_token()? });
        Ok(self.manager.request("restart", params).await?)
    }

    /// Move a cluster to the host named `host`.
    #[instrument(skip(self))]
    pub async fn move_cluster(&self, id: u32, host: &str) -> Result<()> {
        let params = json!({ "id": id, "name": host, "token": self.rpc_token()? });
        self.manager.request("moveCluster", params).await?;
        info!(cluster_id = id, host, "Cluster moved");
        Ok(())
    }

    /// Start a cluster of this host's state.
    #[instrument(skip(self))]
    pub async fn create_cluster(&self, id: u32) -> Result<ProcessInfo> {
        Ok(self.manager.call("createCluster", &json!({ "id": id })).await?)
    }

    // =========================================================================
    // Process manager
    // =========================================================================

    /// Cluster processes of the host.
    #[instrument(skip(self))]
    pub async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        Ok(self.processes.call("list", &json!({})).await?)
    }

    /// Restart one process and wait for its replacement.
    #[instrument(skip(self))]
    pub async fn restart_process(&self, id: &str) -> Result<ProcessInfo> {
        Ok(self.processes.call("restart", &json!({ "id": id })).await?)
    }

    /// Restart the cluster manager of the host.
    #[instrument(skip(self))]
    pub async fn restart_manager(&self) -> Result<()> {
        self.processes.request("restartManager", json!({})).await?;
        Ok(())
    }
}
