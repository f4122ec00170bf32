// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for shardline-cluster.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::sharding::ShardingStrategy;

/// How the orchestrator is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// One process supervises every cluster on this host.
    Direct,
    /// A per-host process manager spawns clusters on behalf of a cluster
    /// manager that reads assignments from the cluster store.
    Hosted,
}

impl FromStr for Topology {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Topology::Direct),
            "hosted" => Ok(Topology::Hosted),
            _ => Err(ConfigError::InvalidValue {
                var: "SHARDLINE_TOPOLOGY",
                value: s.to_string(),
            }),
        }
    }
}

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deployment topology
    pub topology: Topology,
    /// Sharding strategy for the direct topology
    pub strategy: ShardingStrategy,
    /// Fixed shard count; skips the gateway estimate when set
    pub shard_count_override: Option<u32>,
    /// Only spawn these shard ids (sequential strategy)
    pub shard_ids: Option<Vec<u32>>,
    /// Number of clusters (balanced strategies, provisioning)
    pub cluster_count: u32,
    /// Only spawn these cluster indices (balanced strategies)
    pub cluster_ids: Option<Vec<u32>>,
    /// First shard of the range this orchestrator owns
    pub first_shard_override: Option<u32>,
    /// Last shard of the range this orchestrator owns
    pub last_shard_override: Option<u32>,
    /// Delay between spawns in the sequential strategy
    pub shard_spawn_delay: Duration,
    /// Delay between cluster creations in the cluster manager
    pub cluster_start_delay: Duration,
    /// Upper bound on waiting for a worker's ready signal
    pub ready_timeout: Duration,
    /// Pause before retrying a failed crash restart
    pub restart_retry_delay: Duration,
    /// Per-worker timeout for aggregated requests
    pub aggregate_timeout: Duration,
    /// Timeout for worker-to-supervisor requests
    pub ipc_timeout: Duration,
    /// Flush interval of the blocked-event-loop buffer
    pub blocked_flush_interval: Duration,
    /// Flush interval of the shard status buffer
    pub status_flush_interval: Duration,
    /// Host used for RPC servers and clients
    pub rpc_host: String,
    /// Control HTTP server port
    pub control_port: u16,
    /// Process manager RPC port
    pub process_manager_port: u16,
    /// Cluster manager RPC port
    pub manager_rpc_port: u16,
    /// Log stream WebSocket port
    pub log_server_port: u16,
    /// Worker RPC ports are this plus the cluster id
    pub worker_base_port: u16,
    /// Shared secret for restart/move operations
    pub restart_token: Option<String>,
    /// Shared secret for worker RPC methods
    pub rpc_token: Option<String>,
    /// Bot token used for the gateway estimate
    pub client_token: Option<String>,
    /// Gateway API base URL
    pub gateway_url: String,
    /// Webhook receiving blocked/shard status summaries
    pub shard_webhook_url: Option<String>,
    /// Webhook receiving cluster lifecycle messages
    pub cluster_webhook_url: Option<String>,
    /// Host state this orchestrator serves (hosted topology)
    pub state: i32,
    /// Human-readable state name shown in webhook footers
    pub state_name: Option<String>,
    /// Cluster store connection string (hosted topology, provisioning)
    pub database_url: Option<String>,
    /// Program spawned for workers; defaults to the current executable
    pub worker_program: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topology: Topology::Direct,
            strategy: ShardingStrategy::Sequential,
            shard_count_override: None,
            shard_ids: None,
            cluster_count: num_cpus::get() as u32,
            cluster_ids: None,
            first_shard_override: None,
            last_shard_override: None,
            shard_spawn_delay: Duration::from_millis(6500),
            cluster_start_delay: Duration::from_millis(1500),
            ready_timeout: Duration::from_secs(15 * 60),
            restart_retry_delay: Duration::from_secs(1),
            aggregate_timeout: Duration::from_secs(2),
            ipc_timeout: Duration::from_secs(5),
            blocked_flush_interval: Duration::from_secs(5),
            status_flush_interval: Duration::from_secs(14),
            rpc_host: "localhost".to_string(),
            control_port: 5000,
            process_manager_port: 5050,
            manager_rpc_port: 5052,
            log_server_port: 5025,
            worker_base_port: 30000,
            restart_token: None,
            rpc_token: None,
            client_token: None,
            gateway_url: "https://discord.com/api/v10".to_string(),
            shard_webhook_url: None,
            cluster_webhook_url: None,
            state: 0,
            state_name: None,
            database_url: None,
            worker_program: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let topology = match var("SHARDLINE_TOPOLOGY") {
            Some(value) => value.parse()?,
            None => defaults.topology,
        };

        let strategy = match var("SHARDING_STRATEGY") {
            Some(value) => value.parse()?,
            None => defaults.strategy,
        };

        Ok(Self {
            topology,
            strategy,
            shard_count_override: parse_opt("SHARD_COUNT_OVERRIDE")?,
            shard_ids: parse_list("SHARD_IDS")?,
            cluster_count: parse_opt("CLUSTER_COUNT")?.unwrap_or(defaults.cluster_count),
            cluster_ids: parse_list("CLUSTER_IDS")?,
            first_shard_override: parse_opt("FIRST_SHARD_OVERRIDE")?,
            last_shard_override: parse_opt("LAST_SHARD_OVERRIDE")?,
            shard_spawn_delay: millis("SHARD_SPAWN_DELAY_MS", defaults.shard_spawn_delay)?,
            cluster_start_delay: millis("CLUSTER_START_DELAY_MS", defaults.cluster_start_delay)?,
            ready_timeout: millis("READY_TIMEOUT_MS", defaults.ready_timeout)?,
            restart_retry_delay: millis("RESTART_RETRY_DELAY_MS", defaults.restart_retry_delay)?,
            aggregate_timeout: millis("AGGREGATE_TIMEOUT_MS", defaults.aggregate_timeout)?,
            ipc_timeout: millis("IPC_TIMEOUT_MS", defaults.ipc_timeout)?,
            blocked_flush_interval: millis("BLOCKED_FLUSH_MS", defaults.blocked_flush_interval)?,
            status_flush_interval: millis("STATUS_FLUSH_MS", defaults.status_flush_interval)?,
            rpc_host: var("RPC_HOST").unwrap_or(defaults.rpc_host),
            control_port: port("CONTROL_PORT", defaults.control_port)?,
            process_manager_port: port("PROCESS_MANAGER_PORT", defaults.process_manager_port)?,
            manager_rpc_port: port("MANAGER_RPC_PORT", defaults.manager_rpc_port)?,
            log_server_port: port("LOG_SERVER_PORT", defaults.log_server_port)?,
            worker_base_port: port("WORKER_BASE_PORT", defaults.worker_base_port)?,
            restart_token: var("RESTART_TOKEN"),
            rpc_token: var("RPC_TOKEN"),
            client_token: var("CLIENT_TOKEN"),
            gateway_url: var("GATEWAY_URL").unwrap_or(defaults.gateway_url),
            shard_webhook_url: var("SHARD_WEBHOOK_URL"),
            cluster_webhook_url: var("CLUSTER_WEBHOOK_URL"),
            state: parse_opt("STATE")?.unwrap_or(defaults.state),
            state_name: var("STATE_NAME"),
            database_url: var("DATABASE_URL"),
            worker_program: var("SHARDLINE_WORKER_PROGRAM").map(PathBuf::from),
        })
    }

    /// The database URL, required by the hosted cluster manager and provisioning.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingEnvVar("DATABASE_URL"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is present but cannot be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// The port number is invalid.
    #[error("Invalid port number in {0}")]
    InvalidPort(&'static str),
}

/// Non-empty environment variable.
fn var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_opt<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    var(name)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: name,
                value,
            })
        })
        .transpose()
}

/// Comma separated list, e.g. `SHARD_IDS=0,1,5`.
fn parse_list<T: FromStr>(name: &'static str) -> Result<Option<Vec<T>>, ConfigError> {
    let Some(value) = var(name) else {
        return Ok(None);
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse().map_err(|_| ConfigError::InvalidValue {
                var: name,
                value: value.clone(),
            })
        })
        .collect::<Result<Vec<T>, _>>()
        .map(Some)
}

fn millis(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(parse_opt::<u64>(name)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

fn port(name: &'static str, default: u16) -> Result<u16, ConfigError> {
    match var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPort(name)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.topology, Topology::Direct);
        assert_eq!(config.strategy, ShardingStrategy::Sequential);
        assert_eq!(config.shard_spawn_delay, Duration::from_millis(6500));
        assert_eq!(config.aggregate_timeout, Duration::from_millis(2000));
        assert_eq!(config.ipc_timeout, Duration::from_millis(5000));
        assert_eq!(config.control_port, 5000);
        assert_eq!(config.process_manager_port, 5050);
        assert_eq!(config.manager_rpc_port, 5052);
        assert_eq!(config.log_server_port, 5025);
        assert_eq!(config.worker_base_port, 30000);
        assert!(config.cluster_count >= 1);
    }

    #[test]
    fn test_topology_parse() {
        assert_eq!("hosted".parse::<Topology>().unwrap(), Topology::Hosted);
        assert_eq!("Direct".parse::<Topology>().unwrap(), Topology::Direct);
        assert!(matches!(
            "mesh".parse::<Topology>(),
            Err(ConfigError::InvalidValue { var: "SHARDLINE_TOPOLOGY", .. })
        ));
    }

    #[test]
    fn test_require_database_url() {
        let config = Config::default();
        assert!(matches!(
            config.require_database_url(),
            Err(ConfigError::MissingEnvVar("DATABASE_URL"))
        ));
    }
}
