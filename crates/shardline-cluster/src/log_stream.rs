// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log stream server.
//!
//! Every line a child writes to stdout or stderr is published to all
//! connected WebSocket clients as one JSON text frame:
//!
//! ```json
//! {"pid": 4242, "createdAt": "2025-01-01T00:00:00Z", "cm": false, "cid": 3, "msg": "...", "stream": "stderr"}
//! ```
//!
//! Slow clients skip lines instead of holding back the children.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::any;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::runner::{OutputLine, OutputSink, OutputStream};

const CHANNEL_CAPACITY: usize = 1024;

/// One published line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Producing process.
    pub pid: u32,
    /// When the producing process was spawned.
    pub created_at: DateTime<Utc>,
    /// True when the line came from the cluster manager.
    pub cm: bool,
    /// Cluster id of the producing process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<u32>,
    /// The line.
    pub msg: String,
    /// Source pipe.
    pub stream: OutputStream,
}

impl From<OutputLine> for LogEntry {
    fn from(line: OutputLine) -> Self {
        Self {
            pid: line.pid,
            created_at: line.created_at,
            cm: line.manager,
            cid: line.cluster_id,
            msg: line.text,
            stream: line.stream,
        }
    }
}

/// Fans child output out to subscribers.
#[derive(Clone)]
pub struct LogStreamHub {
    sender: broadcast::Sender<Arc<str>>,
}

impl Default for LogStreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStreamHub {
    /// Hub without subscribers.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Receive every entry published from now on, already encoded.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.sender.subscribe()
    }

    /// Connected subscribers.
    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish one entry. Lines are dropped when nobody listens.
    pub fn publish(&self, entry: &LogEntry) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        match serde_json::to_string(entry) {
            Ok(json) => {
                let _ = self.sender.send(Arc::from(json));
            }
            Err(e) => warn!(error = %e, "Failed to encode log entry"),
        }
    }

    /// Router upgrading every request on `/` to a log WebSocket.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", any(upgrade))
            .with_state(self.clone())
    }
}

impl OutputSink for LogStreamHub {
    fn line(&self, line: OutputLine) {
        self.publish(&LogEntry::from(line));
    }
}

async fn upgrade(State(hub): State<LogStreamHub>, ws: WebSocketUpgrade) -> Response {
    let entries = hub.subscribe();
    ws.on_upgrade(move |socket| stream_logs(socket, entries))
}

async fn stream_logs(mut socket: WebSocket, mut entries: broadcast::Receiver<Arc<str>>) {
    debug!("Log stream client connected");
    loop {
        tokio::select! {
            entry = entries.recv() => match entry {
                Ok(json) => {
                    if socket.send(Message::Text(json.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Log stream client lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Log stream client disconnected");
}

/// A running log stream server.
pub struct LogStreamServer {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl LogStreamServer {
    /// Bind `host:port` and serve `hub` in the background.
    pub async fn bind(host: &str, port: u16, hub: LogStreamHub) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let app = hub.router();

        info!(addr = %local_addr, "Log stream server listening");

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.notified().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Log stream server terminated");
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
            error!(error = %e, "Log stream server task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkerId;
    use serde_json::{Value, json};

    fn line(cluster_id: Option<u32>) -> OutputLine {
        OutputLine {
            pid: 4242,
            worker: WorkerId::Cluster(cluster_id.unwrap_or_default()),
            cluster_id,
            manager: cluster_id.is_none(),
            created_at: DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            stream: OutputStream::Stderr,
            text: "hello".to_string(),
        }
    }

    #[test]
    fn test_entry_wire_shape() {
        let entry = LogEntry::from(line(Some(3)));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            value,
            json!({
                "pid": 4242,
                "createdAt": "2025-01-01T00:00:00Z",
                "cm": false,
                "cid": 3,
                "msg": "hello",
                "stream": "stderr",
            })
        );
    }

    #[test]
    fn test_manager_entry_has_no_cid() {
        let value = serde_json::to_value(LogEntry::from(line(None))).unwrap();
        assert_eq!(value["cm"], json!(true));
        assert!(value.get("cid").is_none());
    }

    #[tokio::test]
    async fn test_hub_delivers_to_subscribers() {
        let hub = LogStreamHub::new();
        hub.line(line(Some(1)));

        let mut rx = hub.subscribe();
        assert_eq!(hub.subscribers(), 1);
        hub.line(line(Some(1)));

        let json = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["cid"], json!(1));
        assert!(rx.try_recv().is_err());
    }
}
