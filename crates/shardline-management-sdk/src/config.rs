// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the management SDK.

use std::time::Duration;

use crate::error::{Result, SdkError};

/// Configuration for the ManagementSdk.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    /// Base URL of the control HTTP server (direct topology).
    pub control_url: String,
    /// Host running the cluster manager and process manager RPC servers.
    pub rpc_host: String,
    /// Cluster manager RPC port.
    pub manager_port: u16,
    /// Process manager RPC port.
    pub process_manager_port: u16,
    /// Token for control-server restarts.
    pub restart_token: Option<String>,
    /// Token for authenticated cluster manager methods.
    pub rpc_token: Option<String>,
    /// Request timeout.
    pub request_timeout: Duration,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            control_url: "http://127.0.0.1:5000".to_string(),
            rpc_host: "localhost".to_string(),
            manager_port: 5052,
            process_manager_port: 5050,
            restart_token: None,
            rpc_token: None,
            // Restarts wait for the replacement to connect its shards.
            request_timeout: Duration::from_secs(900),
        }
    }
}

fn parse_port(vars: &impl Fn(&str) -> Option<String>, name: &str, default: u16) -> Result<u16> {
    match vars(name) {
        Some(value) => value
            .parse()
            .map_err(|e| SdkError::Config(format!("invalid {}: {}", name, e))),
        None => Ok(default),
    }
}

impl SdkConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SHARDLINE_CONTROL_URL`: Control server URL (default: "http://127.0.0.1:5000")
    /// - `RPC_HOST`: Manager host (default: "localhost")
    /// - `MANAGER_RPC_PORT`: Cluster manager port (default: 5052)
    /// - `PROCESS_MANAGER_PORT`: Process manager port (default: 5050)
    /// - `RESTART_TOKEN`: Control server restart token
    /// - `RPC_TOKEN`: Cluster manager token
    /// - `SHARDLINE_REQUEST_TIMEOUT_MS`: Request timeout in milliseconds (default: 900000)
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(vars: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let request_timeout = match vars("SHARDLINE_REQUEST_TIMEOUT_MS") {
            Some(value) => Duration::from_millis(value.parse().map_err(|e| {
                SdkError::Config(format!("invalid SHARDLINE_REQUEST_TIMEOUT_MS: {}", e))
            })?),
            None => defaults.request_timeout,
        };

        Ok(Self {
            control_url: vars("SHARDLINE_CONTROL_URL").unwrap_or(defaults.control_url),
            rpc_host: vars("RPC_HOST").unwrap_or(defaults.rpc_host),
            manager_port: parse_port(&vars, "MANAGER_RPC_PORT", defaults.manager_port)?,
            process_manager_port: parse_port(
                &vars,
                "PROCESS_MANAGER_PORT",
                defaults.process_manager_port,
            )?,
            restart_token: vars("RESTART_TOKEN").filter(|t| !t.is_empty()),
            rpc_token: vars("RPC_TOKEN").filter(|t| !t.is_empty()),
            request_timeout,
        })
    }

    /// Set the control server URL.
    pub fn with_control_url(mut self, url: impl Into<String>) -> Self {
        self.control_url = url.into();
        self
    }

    /// Set the manager host.
    pub fn with_rpc_host(mut self, host: impl Into<String>) -> Self {
        self.rpc_host = host.into();
        self
    }

    /// Set the cluster manager port.
    pub fn with_manager_port(mut self, port: u16) -> Self {
        self.manager_port = port;
        self
    }

    /// Set the process manager port.
    pub fn with_process_manager_port(mut self, port: u16) -> Self {
        self.process_manager_port = port;
        self
    }

    /// Set the control-server restart token.
    pub fn with_restart_token(mut self, token: impl Into<String>) -> Self {
        self.restart_token = Some(token.into());
        self
    }

    /// Set the cluster manager token.
    pub fn with_rpc_token(mut self, token: impl Into<String>) -> Self {
        self.rpc_token = Some(token.into());
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
