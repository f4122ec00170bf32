// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP JSON-RPC server with named-method dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::rpc::{RpcError, RpcRequest, RpcResponse};

/// Errors from starting the RPC server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// I/O error on the bound listener.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A named RPC method.
///
/// Returning a `Result` is what guarantees a method answers exactly once.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle one call.
    async fn call(&self, params: Value) -> Result<Value, RpcError>;
}

#[async_trait]
impl<H: RpcHandler + ?Sized> RpcHandler for Arc<H> {
    async fn call(&self, params: Value) -> Result<Value, RpcError> {
        (**self).call(params).await
    }
}

/// Adapter turning an async closure into an [`RpcHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send,
{
    async fn call(&self, params: Value) -> Result<Value, RpcError> {
        (self.0)(params).await
    }
}

/// Token check in front of another handler.
///
/// Fails closed: the inner handler only runs when `params.token` is a string
/// equal to the shared secret. An empty secret rejects every call.
pub struct Authenticated<H> {
    token: String,
    inner: H,
}

impl<H> Authenticated<H> {
    /// Guard `inner` with `token`.
    pub fn new(token: impl Into<String>, inner: H) -> Self {
        Self {
            token: token.into(),
            inner,
        }
    }

    fn accepts(&self, params: &Value) -> bool {
        if self.token.is_empty() {
            return false;
        }
        params
            .get("token")
            .and_then(Value::as_str)
            .is_some_and(|token| token == self.token)
    }
}

#[async_trait]
impl<H: RpcHandler> RpcHandler for Authenticated<H> {
    async fn call(&self, params: Value) -> Result<Value, RpcError> {
        if !self.accepts(&params) {
            return Err(RpcError::invalid_token());
        }
        debug!("RPC auth passed");
        self.inner.call(params).await
    }
}

/// Method table served by [`RpcServer`].
#[derive(Clone, Default)]
pub struct RpcMethods {
    methods: HashMap<String, Arc<dyn RpcHandler>>,
}

impl RpcMethods {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register(mut self, name: impl Into<String>, handler: impl RpcHandler + 'static) -> Self {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    /// Register `handler` behind an [`Authenticated`] token check.
    pub fn register_authenticated(
        self,
        name: impl Into<String>,
        token: impl Into<String>,
        handler: impl RpcHandler + 'static,
    ) -> Self {
        self.register(name, Authenticated::new(token, handler))
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Route one request to its handler.
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let Some(handler) = self.methods.get(&request.method) else {
            debug!(method = %request.method, "Unknown RPC method");
            return RpcResponse::failure(request.id, RpcError::method_not_found(&request.method));
        };

        match handler.call(request.params).await {
            Ok(result) => RpcResponse::success(request.id, result),
            Err(e) => {
                debug!(method = %request.method, error = %e, "RPC method failed");
                RpcResponse::failure(request.id, e)
            }
        }
    }

    /// Parse a raw body and dispatch it.
    pub async fn dispatch_body(&self, body: &[u8]) -> RpcResponse {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => return RpcResponse::failure(Value::Null, RpcError::parse_error(e)),
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<RpcRequest>(value) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => RpcResponse::failure(id, RpcError::invalid_request(e)),
        }
    }

    /// Axum router serving this table at `POST /`.
    pub fn into_router(self) -> Router {
        Router::new()
            .route("/", post(handle_rpc))
            .with_state(Arc::new(self))
    }
}

async fn handle_rpc(State(methods): State<Arc<RpcMethods>>, body: Bytes) -> Json<RpcResponse> {
    Json(methods.dispatch_body(&body).await)
}

/// A running RPC server.
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl RpcServer {
    /// Bind `host:port` and start serving `methods` in the background.
    pub async fn bind(host: &str, port: u16, methods: RpcMethods) -> Result<Self, ServerError> {
        let listener = tokio::net::TcpListener::bind((host, port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: format!("{}:{}", host, port),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let router = methods.into_router();

        info!(addr = %local_addr, "RPC server listening");

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.notified().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "RPC server terminated");
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    /// Address actually bound (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            error!(error = %e, "RPC server task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_method() {
        let methods = RpcMethods::new();
        let response = methods
            .dispatch(RpcRequest::new("nope", json!({}), 1))
            .await;
        assert_eq!(response.id, json!(1));
        assert_eq!(
            response.error.map(|e| e.code),
            Some(crate::rpc::METHOD_NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let methods = RpcMethods::new();
        let response = methods.dispatch_body(b"{not json").await;
        assert_eq!(response.error.map(|e| e.code), Some(crate::rpc::PARSE_ERROR));
    }

    #[tokio::test]
    async fn test_empty_secret_rejects_everything() {
        let handler = Authenticated::new("", handler_fn(|_| async { Ok(json!("ran")) }));
        let result = handler.call(json!({"token": ""})).await;
        assert_eq!(result, Err(RpcError::invalid_token()));
    }

    #[test]
    fn test_names_sorted() {
        let noop = || handler_fn(|_| async { Ok(Value::Null) });
        let methods = RpcMethods::new()
            .register("restart", noop())
            .register("blocked", noop());
        assert_eq!(methods.names(), vec!["blocked", "restart"]);
    }
}
