// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable shard manager for the direct topology.
//!
//! [`ShardManagerRuntime`] wires the supervisor, the sharding rollout, the
//! control HTTP server and the status fan-in into one host process.
//!
//! ```rust,ignore
//! use shardline_cluster::{Config, runtime::ShardManagerRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ShardManagerRuntime::builder()
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::control_server::{ControlServer, ControlState};
use crate::fan_in::{FanInConfig, LogFanIn, StatusSink, sink_for};
use crate::gateway::{DiscordGateway, GatewayEstimator, UnavailableGateway};
use crate::process_manager::worker_spawner;
use crate::runner::ProcessSpawner;
use crate::sharding::{RolloutReport, Sharding};
use crate::supervisor::{ReportingObserver, Supervisor, SupervisorConfig};

/// Builder for a [`ShardManagerRuntime`].
#[derive(Default)]
pub struct ShardManagerRuntimeBuilder {
    config: Option<Config>,
    spawner: Option<Arc<dyn ProcessSpawner>>,
    gateway: Option<Arc<dyn GatewayEstimator>>,
    shard_sink: Option<Arc<dyn StatusSink>>,
    cluster_sink: Option<Arc<dyn StatusSink>>,
    control_host: Option<String>,
}

impl ShardManagerRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the process spawner.
    ///
    /// Default: a native spawner running `SHARDLINE_WORKER_PROGRAM` or the
    /// current executable.
    pub fn spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Set the shard count source.
    ///
    /// Default: the Discord gateway when `CLIENT_TOKEN` is set.
    pub fn gateway(mut self, gateway: Arc<dyn GatewayEstimator>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set where shard status summaries are posted.
    ///
    /// Default: `SHARD_WEBHOOK_URL`, or the log.
    pub fn shard_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.shard_sink = Some(sink);
        self
    }

    /// Set where cluster lifecycle messages are posted.
    ///
    /// Default: `CLUSTER_WEBHOOK_URL`, or the log.
    pub fn cluster_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.cluster_sink = Some(sink);
        self
    }

    /// Set the interface the control server binds to.
    ///
    /// Default: `0.0.0.0`
    pub fn control_host(mut self, host: impl Into<String>) -> Self {
        self.control_host = Some(host.into());
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<ShardManagerRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;

        let spawner: Arc<dyn ProcessSpawner> = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(worker_spawner(&config)?),
        };
        let gateway: Arc<dyn GatewayEstimator> = match (self.gateway, &config.client_token) {
            (Some(gateway), _) => gateway,
            (None, Some(token)) => Arc::new(DiscordGateway::new(config.gateway_url.clone(), token.clone())),
            (None, None) => Arc::new(UnavailableGateway),
        };
        let shard_sink = self.shard_sink.unwrap_or_else(|| {
            sink_for(
                config.shard_webhook_url.as_deref(),
                "Shard Manager",
                config.state_name.clone(),
            )
        });
        let cluster_sink = self.cluster_sink.unwrap_or_else(|| {
            sink_for(
                config.cluster_webhook_url.as_deref(),
                "Cluster Manager",
                config.state_name.clone(),
            )
        });

        Ok(ShardManagerRuntimeConfig {
            config,
            spawner,
            gateway,
            shard_sink,
            cluster_sink,
            control_host: self.control_host.unwrap_or_else(|| "0.0.0.0".to_string()),
        })
    }
}

/// Configuration for a [`ShardManagerRuntime`].
pub struct ShardManagerRuntimeConfig {
    config: Config,
    spawner: Arc<dyn ProcessSpawner>,
    gateway: Arc<dyn GatewayEstimator>,
    shard_sink: Arc<dyn StatusSink>,
    cluster_sink: Arc<dyn StatusSink>,
    control_host: String,
}

impl ShardManagerRuntimeConfig {
    /// Start supervision, the fan-in, the control server and the rollout.
    pub async fn start(self) -> Result<ShardManagerRuntime> {
        let fan_in = Arc::new(LogFanIn::new(
            self.shard_sink,
            FanInConfig {
                blocked_interval: self.config.blocked_flush_interval,
                status_interval: self.config.status_flush_interval,
                ..FanInConfig::default()
            },
        ));
        let fan_in_shutdown = fan_in.shutdown_handle();
        let fan_in_handle = {
            let fan_in = fan_in.clone();
            tokio::spawn(async move { fan_in.run().await })
        };

        let observer = Arc::new(ReportingObserver::new(fan_in.clone(), self.cluster_sink));
        let supervisor = Supervisor::new(
            self.spawner.clone(),
            SupervisorConfig::from(&self.config),
            observer,
        );
        let supervisor_handle = tokio::spawn(supervisor.clone().run());

        let state = ControlState::new(supervisor.clone(), self.config.restart_token.clone())
            .with_reloader(fan_in.clone());
        let control = ControlServer::bind(&self.control_host, self.config.control_port, state).await?;
        let control_addr = control.local_addr();

        let sharding = Sharding::new(self.config, self.gateway);
        let strategy = sharding.strategy();
        let rollout_handle = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { sharding.run_logged(&supervisor).await })
        };

        info!(
            control_addr = %control_addr,
            strategy = %strategy,
            spawner = self.spawner.spawner_type(),
            "ShardManagerRuntime started"
        );

        Ok(ShardManagerRuntime {
            supervisor,
            fan_in,
            control,
            control_addr,
            supervisor_handle,
            fan_in_handle,
            fan_in_shutdown,
            rollout_handle,
        })
    }
}

/// A running direct-topology shard manager.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ShardManagerRuntime {
    supervisor: Arc<Supervisor>,
    fan_in: Arc<LogFanIn>,
    control: ControlServer,
    control_addr: SocketAddr,
    supervisor_handle: JoinHandle<()>,
    fan_in_handle: JoinHandle<()>,
    fan_in_shutdown: Arc<Notify>,
    rollout_handle: JoinHandle<Option<RolloutReport>>,
}

impl ShardManagerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ShardManagerRuntimeBuilder {
        ShardManagerRuntimeBuilder::new()
    }

    /// Address the control server listens on.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// The supervisor.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// The status fan-in.
    pub fn fan_in(&self) -> &Arc<LogFanIn> {
        &self.fan_in
    }

    /// Wait for the initial rollout to finish.
    pub async fn rollout(&mut self) -> Option<RolloutReport> {
        (&mut self.rollout_handle).await.ok().flatten()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the rollout, SIGTERMs every worker, stops the control server
    /// and flushes the fan-in one last time.
    pub async fn shutdown(self) -> Result<()> {
        info!("ShardManagerRuntime shutting down...");

        self.rollout_handle.abort();
        self.supervisor.shutdown();
        self.control.shutdown().await;

        if let Err(e) = self.supervisor_handle.await {
            debug!(error = %e, "Supervisor task ended abnormally");
        }

        self.fan_in_shutdown.notify_one();
        if let Err(e) = self.fan_in_handle.await {
            debug!(error = %e, "Fan-in task ended abnormally");
        }

        info!("ShardManagerRuntime stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::gateway::UnavailableGateway;
    use crate::runner::MockSpawner;
    use crate::sharding::ShardingStrategy;

    fn config() -> Config {
        Config {
            strategy: ShardingStrategy::Sequential,
            shard_count_override: Some(3),
            shard_spawn_delay: Duration::ZERO,
            control_port: 0,
            ..Config::default()
        }
    }

    #[test]
    fn test_build_requires_config() {
        let err = ShardManagerRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("config is required"));
    }

    #[tokio::test]
    async fn test_start_rollout_and_shutdown() {
        let spawner = Arc::new(MockSpawner::new());
        let mut runtime = ShardManagerRuntime::builder()
            .config(config())
            .spawner(spawner.clone())
            .gateway(Arc::new(UnavailableGateway))
            .control_host("127.0.0.1")
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let report = runtime.rollout().await.unwrap();
        assert_eq!(report.spawned, vec![0, 1, 2]);
        assert_eq!(runtime.supervisor().registry().len(), 3);
        assert_ne!(runtime.control_addr().port(), 0);

        runtime.shutdown().await.unwrap();
        assert!(spawner.processes().iter().all(|process| !process.is_running()));
    }
}
