// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shardline - Gateway Shard Orchestrator
//!
//! One binary, four roles, chosen from the environment:
//! - worker: `id`/`shardId` and `shardCount` are set by a supervising parent
//! - cluster manager: `manager` is set by a host process manager
//! - direct orchestrator: `SHARDLINE_TOPOLOGY=direct` (default)
//! - host process manager: `SHARDLINE_TOPOLOGY=hosted`
//!
//! Every role logs to stderr; a child's stdout carries IPC messages.

use anyhow::Result;
use tracing::{error, info};

use shardline_cluster::cluster_manager::run_cluster_manager;
use shardline_cluster::config::{Config, Topology};
use shardline_cluster::process_manager::run_process_manager;
use shardline_cluster::runtime::ShardManagerRuntime;
use shardline_cluster::worker_process::{WorkerEnv, run_worker};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardline_cluster=info".into()),
        )
        .init();

    std::panic::set_hook(Box::new(|panic| {
        error!(panic = %panic, "Unhandled panic");
    }));

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    if let Some(env) = WorkerEnv::from_env()? {
        return run_worker(env, &config).await;
    }

    if std::env::var_os("manager").is_some() {
        info!(state = config.state, "Starting cluster manager");
        return run_cluster_manager(config).await;
    }

    match config.topology {
        Topology::Direct => {
            info!(
                strategy = %config.strategy,
                control_port = config.control_port,
                "Starting Shardline"
            );

            let runtime = ShardManagerRuntime::builder()
                .config(config)
                .build()?
                .start()
                .await?;

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");

            runtime.shutdown().await?;
            info!("Shardline shut down");
            Ok(())
        }
        Topology::Hosted => {
            info!(
                port = config.process_manager_port,
                "Starting process manager"
            );
            run_process_manager(config).await
        }
    }
}
