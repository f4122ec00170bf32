// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log and status fan-in.
//!
//! Workers report blocked event loops and shard status transitions far more
//! often than a webhook accepts posts. [`LogFanIn`] buffers both kinds of
//! notice and flushes each buffer on its own timer as one message. Empty
//! buffers are never posted.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::time::{Instant, interval_at};
use tracing::{error, info};

use crate::error::Result;

/// Title of the blocked event loop summary.
pub const BLOCKED_TITLE: &str = "Event Loops Blocked";

/// Title of the shard status summary.
pub const STATUS_TITLE: &str = "Shard Status Updates";

/// Posted messages are split to stay below this many characters.
pub const MAX_MESSAGE_LEN: usize = 1900;

/// A name/value pair attached to a posted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedField {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: String,
}

impl EmbedField {
    /// Field with `name` and `value`.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// External sink for human-readable status messages.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Post one message.
    async fn post(&self, title: &str, text: Option<&str>, fields: &[EmbedField]) -> Result<()>;
}

/// Posts Discord-style webhook embeds.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
    username: String,
    state_name: Option<String>,
}

impl WebhookSink {
    /// Sink posting to `url` as `username`. `state_name` becomes the footer.
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        state_name: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            username: username.into(),
            state_name,
        }
    }

    fn payload(&self, title: &str, text: Option<&str>, fields: &[EmbedField]) -> Value {
        let mut embed = json!({
            "title": title,
            "timestamp": Utc::now().to_rfc3339(),
            "footer": { "text": self.state_name },
        });
        if let Some(text) = text {
            embed["description"] = json!(text);
        }
        if !fields.is_empty() {
            embed["fields"] = json!(fields);
        }
        json!({
            "username": self.username,
            "tts": false,
            "embeds": [embed],
        })
    }
}

#[async_trait]
impl StatusSink for WebhookSink {
    async fn post(&self, title: &str, text: Option<&str>, fields: &[EmbedField]) -> Result<()> {
        self.http
            .post(&self.url)
            .json(&self.payload(title, text, fields))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Writes messages to the process log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl StatusSink for TracingSink {
    async fn post(&self, title: &str, text: Option<&str>, fields: &[EmbedField]) -> Result<()> {
        let fields: Vec<String> = fields
            .iter()
            .map(|f| format!("{}: {}", f.name, f.value))
            .collect();
        info!(fields = %fields.join(", "), "{}\n{}", title, text.unwrap_or_default());
        Ok(())
    }
}

/// Sink for `url` when configured, the log otherwise.
pub fn sink_for(url: Option<&str>, username: &str, state_name: Option<String>) -> Arc<dyn StatusSink> {
    match url {
        Some(url) => Arc::new(WebhookSink::new(url, username, state_name)),
        None => Arc::new(TracingSink),
    }
}

/// A notice a worker reported about itself or its shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerNotice {
    /// The worker's event loop lagged.
    Blocked(String),
    /// A shard finished connecting.
    ShardReady {
        /// Reporting cluster.
        cluster: Option<u32>,
        /// Shard id.
        shard: u32,
    },
    /// A shard resumed its session.
    ShardResume {
        /// Reporting cluster.
        cluster: Option<u32>,
        /// Shard id.
        shard: u32,
    },
    /// A shard sent IDENTIFY.
    ShardIdentify {
        /// Reporting cluster.
        cluster: Option<u32>,
        /// Shard id.
        shard: u32,
    },
    /// A shard lost its connection.
    ShardDisconnect {
        /// Reporting cluster.
        cluster: Option<u32>,
        /// Shard id.
        shard: u32,
        /// Close reason.
        err: Option<String>,
    },
}

fn prefix(cluster: Option<u32>) -> String {
    match cluster {
        Some(id) => format!("[C{}] ", id),
        None => String::new(),
    }
}

impl WorkerNotice {
    /// Human-readable line for the summary.
    pub fn line(&self) -> String {
        match self {
            WorkerNotice::Blocked(text) => text.clone(),
            WorkerNotice::ShardReady { cluster, shard } => {
                format!("{}Shard {} ready.", prefix(*cluster), shard)
            }
            WorkerNotice::ShardResume { cluster, shard } => {
                format!("{}Shard {} resumed.", prefix(*cluster), shard)
            }
            WorkerNotice::ShardIdentify { cluster, shard } => {
                format!("{}Shard {} identified.", prefix(*cluster), shard)
            }
            WorkerNotice::ShardDisconnect { cluster, shard, err } => match err {
                Some(err) => format!("{}Shard {} disconnected. {}", prefix(*cluster), shard, err),
                None => format!("{}Shard {} disconnected.", prefix(*cluster), shard),
            },
        }
    }
}

/// Split `lines` into newline-joined messages of at most `max_len` characters.
///
/// Lines are never reordered. A single line longer than `max_len` is cut.
pub fn split_message(lines: &[String], max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut messages = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in lines {
        let mut chars: Vec<char> = line.chars().collect();
        while chars.len() > max_len {
            let rest = chars.split_off(max_len);
            if current_len > 0 {
                messages.push(std::mem::take(&mut current));
                current_len = 0;
            }
            messages.push(chars.into_iter().collect());
            chars = rest;
        }

        let len = chars.len();
        let needed = if current_len == 0 { len } else { current_len + 1 + len };
        if needed > max_len {
            messages.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push('\n');
            current_len += 1;
        }
        current.extend(chars);
        current_len += len;
    }

    if current_len > 0 {
        messages.push(current);
    }
    messages
}

/// Flush timing.
#[derive(Debug, Clone)]
pub struct FanInConfig {
    /// Blocked buffer flush period.
    pub blocked_interval: Duration,
    /// Status buffer flush period.
    pub status_interval: Duration,
    /// Longest posted message.
    pub max_message_len: usize,
}

impl Default for FanInConfig {
    fn default() -> Self {
        Self {
            blocked_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(14),
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

/// Batches worker notices and posts them on timers.
pub struct LogFanIn {
    blocked: Mutex<Vec<String>>,
    status: Mutex<Vec<String>>,
    sink: Arc<dyn StatusSink>,
    config: FanInConfig,
    shutdown: Arc<Notify>,
}

fn lock(buffer: &Mutex<Vec<String>>) -> MutexGuard<'_, Vec<String>> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LogFanIn {
    /// Fan-in posting to `sink`.
    pub fn new(sink: Arc<dyn StatusSink>, config: FanInConfig) -> Self {
        Self {
            blocked: Mutex::new(Vec::new()),
            status: Mutex::new(Vec::new()),
            sink,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Buffer a notice.
    pub fn record(&self, notice: &WorkerNotice) {
        match notice {
            WorkerNotice::Blocked(text) => self.push_blocked(text.clone()),
            other => self.push_status(other.line()),
        }
    }

    /// Buffer a blocked event loop line.
    pub fn push_blocked(&self, line: String) {
        lock(&self.blocked).push(line);
    }

    /// Buffer a shard status line.
    pub fn push_status(&self, line: String) {
        lock(&self.status).push(line);
    }

    /// Lines waiting in the (blocked, status) buffers.
    pub fn buffered(&self) -> (usize, usize) {
        (lock(&self.blocked).len(), lock(&self.status).len())
    }

    /// Post and clear the blocked buffer.
    pub async fn flush_blocked(&self) {
        let lines = std::mem::take(&mut *lock(&self.blocked));
        self.post(BLOCKED_TITLE, lines).await;
    }

    /// Post and clear the status buffer.
    pub async fn flush_status(&self) {
        let lines = std::mem::take(&mut *lock(&self.status));
        self.post(STATUS_TITLE, lines).await;
    }

    async fn post(&self, title: &str, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        for message in split_message(&lines, self.config.max_message_len) {
            if let Err(e) = self.sink.post(title, Some(&message), &[]).await {
                error!(title, error = %e, "Failed to post status summary");
            }
        }
    }

    /// Handle used to stop [`run`](Self::run).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Flush both buffers on their timers until shutdown, then flush once
    /// more.
    pub async fn run(&self) {
        let start = Instant::now();
        let mut blocked = interval_at(
            start + self.config.blocked_interval,
            self.config.blocked_interval,
        );
        let mut status = interval_at(
            start + self.config.status_interval,
            self.config.status_interval,
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    break;
                }

                _ = blocked.tick() => self.flush_blocked().await,

                _ = status.tick() => self.flush_status().await,
            }
        }

        self.flush_blocked().await;
        self.flush_status().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        posts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn post(&self, title: &str, text: Option<&str>, _fields: &[EmbedField]) -> Result<()> {
            self.posts
                .lock()
                .unwrap()
                .push((title.to_string(), text.unwrap_or_default().to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_notice_lines() {
        let notice = WorkerNotice::ShardDisconnect {
            cluster: Some(3),
            shard: 12,
            err: Some("1006".to_string()),
        };
        assert_eq!(notice.line(), "[C3] Shard 12 disconnected. 1006");
        let ready = WorkerNotice::ShardReady {
            cluster: None,
            shard: 1,
        };
        assert_eq!(ready.line(), "Shard 1 ready.");
    }

    #[test]
    fn test_split_message() {
        let lines: Vec<String> = vec!["aaaa".into(), "bbbb".into(), "cc".into()];
        assert_eq!(split_message(&lines, 9), vec!["aaaa\nbbbb", "cc"]);
        assert_eq!(split_message(&lines, 100), vec!["aaaa\nbbbb\ncc"]);
        assert_eq!(split_message(&["abcdefg".to_string()], 3), vec!["abc", "def", "g"]);
        assert!(split_message(&[], 10).is_empty());
    }

    #[test]
    fn test_split_respects_limit() {
        let lines: Vec<String> = (0..500).map(|i| format!("[C{}] Shard {} ready.", i % 7, i)).collect();
        let messages = split_message(&lines, MAX_MESSAGE_LEN);
        assert!(messages.iter().all(|m| m.chars().count() <= MAX_MESSAGE_LEN));
        assert_eq!(messages.join("\n"), lines.join("\n"));
    }

    #[tokio::test]
    async fn test_empty_buffers_are_not_posted() {
        let sink = Arc::new(RecordingSink::default());
        let fan_in = LogFanIn::new(sink.clone(), FanInConfig::default());
        fan_in.flush_blocked().await;
        fan_in.flush_status().await;
        assert!(sink.posts.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_flush_independently() {
        let sink = Arc::new(RecordingSink::default());
        let fan_in = Arc::new(LogFanIn::new(sink.clone(), FanInConfig::default()));
        let runner = fan_in.clone();
        let task = tokio::spawn(async move { runner.run().await });

        fan_in.record(&WorkerNotice::Blocked("Cluster 0 blocked for 120ms".to_string()));
        fan_in.record(&WorkerNotice::ShardReady {
            cluster: Some(0),
            shard: 0,
        });
        fan_in.record(&WorkerNotice::ShardResume {
            cluster: Some(0),
            shard: 1,
        });

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(
            *sink.posts.lock().unwrap(),
            vec![(BLOCKED_TITLE.to_string(), "Cluster 0 blocked for 120ms".to_string())]
        );
        assert_eq!(fan_in.buffered(), (0, 2));

        tokio::time::sleep(Duration::from_millis(9_000)).await;
        let posts = sink.posts.lock().unwrap().clone();
        assert_eq!(posts.len(), 2);
        assert_eq!(
            posts[1],
            (
                STATUS_TITLE.to_string(),
                "[C0] Shard 0 ready.\n[C0] Shard 1 resumed.".to_string()
            )
        );

        fan_in.shutdown_handle().notify_one();
        task.await.unwrap();
    }
}
