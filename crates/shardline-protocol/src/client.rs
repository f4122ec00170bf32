// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP JSON-RPC client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::rpc::{RpcError, RpcRequest, RpcResponse};

/// Errors from RPC client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection refused, reset, or an HTTP-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with an error object.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// The reply was not a usable envelope.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Serializing params or deserializing a typed result failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// The server-side error, when the call reached a handler.
    pub fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            ClientError::Rpc(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration for [`RpcClient`].
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Optional whole-request timeout. `None` leaves latency unbounded.
    pub request_timeout: Option<Duration>,
}

impl RpcClientConfig {
    /// Config for `host:port` without a timeout.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            request_timeout: None,
        }
    }

    /// Set a request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// JSON-RPC client bound to one server.
///
/// Cheap to clone; clones share the connection pool and id sequence.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    /// Client for `http://host:port/` with no request timeout.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("http://{}:{}/", host, port),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Client from an explicit config.
    pub fn with_config(config: RpcClientConfig) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
            endpoint: format!("http://{}:{}/", config.host, config.port),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Server URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Call `method` and wait for its result.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, id);

        debug!(endpoint = %self.endpoint, method, id, "RPC request");

        let response: RpcResponse = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.id != Value::from(id) {
            return Err(ClientError::InvalidResponse(format!(
                "correlation id mismatch: sent {}, got {}",
                id, response.id
            )));
        }

        Ok(response.into_result()?)
    }

    /// Typed variant of [`request`](Self::request).
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.request(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Fire a request without waiting for it. Failures are logged and dropped.
    pub fn notify(&self, method: &str, params: Value) {
        let client = self.clone();
        let method = method.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.request(&method, params).await {
                warn!(endpoint = %client.endpoint, method = %method, error = %e, "RPC notification failed");
            }
        });
    }
}
