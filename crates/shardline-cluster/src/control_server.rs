// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control HTTP server of the direct topology.
//!
//! Routes:
//!
//! | Method | Path | Action |
//! |--------|------|--------|
//! | GET | `/ping` | `Pong!` |
//! | GET | `/shards` | aggregated `shards` query |
//! | POST | `/ping` | aggregated `ping` query |
//! | POST | `/restart` | `{id, token}`; `"all"` restarts one cluster at a time |
//! | POST | `/guildUpdate` | broadcast to every worker |
//! | POST | `/stats` | broadcast to every worker |
//! | POST | `/reload` | `{c}`; reload a named module |
//!
//! Any other path or method answers `404 Not Found`. Responses are plain text, or JSON
//! for aggregated queries.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use shardline_protocol::{DiagnosticQuery, ManagerMessage};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::fan_in::LogFanIn;
use crate::supervisor::Supervisor;

/// Reloads a named in-process module on `POST /reload`.
#[async_trait]
pub trait ModuleReloader: Send + Sync {
    /// Reload `module`.
    async fn reload(&self, module: &str) -> Result<()>;
}

/// `logger` flushes both notice buffers immediately.
#[async_trait]
impl ModuleReloader for LogFanIn {
    async fn reload(&self, module: &str) -> Result<()> {
        match module {
            "logger" => {
                self.flush_blocked().await;
                self.flush_status().await;
                Ok(())
            }
            other => Err(Error::Other(format!("Unknown module {}", other))),
        }
    }
}

/// Rejects every module.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReload;

#[async_trait]
impl ModuleReloader for NoReload {
    async fn reload(&self, module: &str) -> Result<()> {
        Err(Error::Other(format!("Unknown module {}", module)))
    }
}

/// Shared state of the control routes.
#[derive(Clone)]
pub struct ControlState {
    supervisor: Arc<Supervisor>,
    restart_token: Option<String>,
    reloader: Arc<dyn ModuleReloader>,
}

impl ControlState {
    /// State for `supervisor`. Without a restart token every restart is
    /// forbidden.
    pub fn new(supervisor: Arc<Supervisor>, restart_token: Option<String>) -> Self {
        Self {
            supervisor,
            restart_token,
            reloader: Arc::new(NoReload),
        }
    }

    /// Use `reloader` for `POST /reload`.
    pub fn with_reloader(mut self, reloader: Arc<dyn ModuleReloader>) -> Self {
        self.reloader = reloader;
        self
    }
}

/// Router serving the control routes.
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/ping", get(ping).post(ping_workers))
        .route("/shards", get(shards))
        .route("/restart", post(restart))
        .route("/guildUpdate", post(guild_update))
        .route("/stats", post(stats))
        .route("/reload", post(reload))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .with_state(state)
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

fn invalid_request() -> Response {
    text(StatusCode::INTERNAL_SERVER_ERROR, "Invalid request")
}

async fn not_found() -> Response {
    text(StatusCode::NOT_FOUND, "Not Found")
}

async fn ping() -> &'static str {
    "Pong!"
}

async fn ping_workers(State(state): State<ControlState>) -> Response {
    aggregate(&state, DiagnosticQuery::Ping).await
}

async fn shards(State(state): State<ControlState>) -> Response {
    aggregate(&state, DiagnosticQuery::Shards).await
}

async fn guild_update(State(state): State<ControlState>, body: Bytes) -> Response {
    if body.is_empty() {
        return invalid_request();
    }
    let body = String::from_utf8_lossy(&body);
    let sent = state
        .supervisor
        .broadcast(ManagerMessage::GuildUpdate(body_value(&body)))
        .await;
    info!(workers = sent, "Guild update broadcast");
    text(StatusCode::OK, "OK")
}

async fn stats(State(state): State<ControlState>, body: Bytes) -> Response {
    if body.is_empty() {
        return invalid_request();
    }
    let body = String::from_utf8_lossy(&body);
    let payload = json!({ "op": "postStats", "d": body_value(&body) });
    state
        .supervisor
        .broadcast(ManagerMessage::Broadcast(payload))
        .await;
    text(StatusCode::OK, "OK")
}

/// JSON when the body parses, the raw text otherwise.
fn body_value(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::from(body))
}

async fn aggregate(state: &ControlState, query: DiagnosticQuery) -> Response {
    let entries = state.supervisor.aggregate(query).await;
    match serde_json::to_string(&entries) {
        Ok(json) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            json,
        )
            .into_response(),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Cluster ids arrive as numbers or numeric strings.
fn cluster_id(id: &Value) -> Option<u32> {
    match id {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

async fn restart(State(state): State<ControlState>, body: Bytes) -> Response {
    if body.is_empty() {
        return invalid_request();
    }
    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => return text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let token = body.get("token").filter(|token| match token {
        Value::String(s) => !s.is_empty(),
        Value::Null | Value::Bool(false) => false,
        _ => true,
    });
    let id = body.get("id").filter(|id| !id.is_null());
    let (Some(token), Some(id)) = (token, id) else {
        return invalid_request();
    };

    let authorized = matches!(
        (token.as_str(), state.restart_token.as_deref()),
        (Some(given), Some(expected)) if !expected.is_empty() && given == expected
    );
    if !authorized {
        warn!("Restart rejected: bad token");
        return text(StatusCode::FORBIDDEN, "Forbidden");
    }

    if id.as_str() == Some("all") {
        for (label, result) in state.supervisor.restart_all().await {
            if let Err(e) = result {
                error!(cluster = %label, error = %e, "Restart failed");
            }
        }
        return text(StatusCode::OK, "OK");
    }

    let Some(handle) = cluster_id(id).and_then(|id| state.supervisor.registry().find_cluster(id))
    else {
        return text(StatusCode::NOT_FOUND, "Cluster not found");
    };

    info!(worker = %handle.id(), "Restart requested over HTTP");
    tokio::spawn(async move {
        if let Err(e) = handle.restart(true).await {
            error!(worker = %handle.id(), error = %e, "Restart failed");
        }
    });
    text(StatusCode::OK, "OK")
}

async fn reload(State(state): State<ControlState>, body: Bytes) -> Response {
    if body.is_empty() {
        return invalid_request();
    }
    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Invalid reload body");
            return text(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
        }
    };
    let Some(module) = body.get("c").and_then(Value::as_str).filter(|c| !c.is_empty()) else {
        return invalid_request();
    };

    match state.reloader.reload(module).await {
        Ok(()) => info!(module, "Module reloaded"),
        Err(e) => warn!(module, error = %e, "Module reload failed"),
    }
    text(StatusCode::OK, "OK")
}

/// A running control server.
pub struct ControlServer {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl ControlServer {
    /// Bind `host:port` and serve the control routes in the background.
    pub async fn bind(host: &str, port: u16, state: ControlState) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let app = router(state);

        info!(addr = %local_addr, "Control server listening");

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.notified().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Control server terminated");
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Control server task panicked");
        }
        info!("Control server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_id_forms() {
        assert_eq!(cluster_id(&json!(3)), Some(3));
        assert_eq!(cluster_id(&json!("12")), Some(12));
        assert_eq!(cluster_id(&json!("abc")), None);
        assert_eq!(cluster_id(&json!(-1)), None);
    }

    #[test]
    fn test_body_value_falls_back_to_text() {
        assert_eq!(body_value(r#"{"guilds":10}"#), json!({"guilds": 10}));
        assert_eq!(body_value("plain"), json!("plain"));
    }
}
