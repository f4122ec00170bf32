// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shardline Cluster - shard partitioning and worker supervision
//!
//! This crate decides how many gateway shards exist, groups them into
//! clusters, runs each cluster as a worker OS process and keeps those
//! processes alive across crashes and operator restarts.
//!
//! # Topologies
//!
//! ```text
//! Direct (single host)
//! ┌──────────────────────────────────────────────────────────┐
//! │ ShardManagerRuntime                                      │
//! │  Sharding ──► Supervisor ──► ProcessRegistry             │
//! │  ControlServer :5000   LogFanIn ──► webhook              │
//! └──────────────┬───────────────────────────────────────────┘
//!                │ spawn (stdin/stdout IPC)
//!                ▼
//!         worker  worker  worker ...
//!
//! Hosted (many hosts)
//! ┌──────────────────────┐   JSON-RPC    ┌──────────────────────────┐
//! │ ClusterManager :5052 │◄─────────────►│ ProcessManager :5050     │
//! │ (ClusterStore)       │               │ LogStream :5025          │
//! └──────────────────────┘               └────────────┬─────────────┘
//!                                                     │ spawn
//!                                                     ▼
//!                                       worker :30000+id  worker ...
//! ```
//!
//! # Process roles
//!
//! The `shardline` binary picks its role from the environment:
//!
//! | Variables present | Role |
//! |-------------------|------|
//! | `id`/`shardId` and `shardCount` | worker ([`worker_process`]) |
//! | `manager` | cluster manager ([`cluster_manager`]) |
//! | neither | orchestrator: [`runtime`] (direct) or [`process_manager`] (hosted) |

pub mod cluster_manager;
pub mod config;
pub mod control_server;
pub mod error;
pub mod fan_in;
pub mod gateway;
pub mod log_stream;
pub mod model;
pub mod partition;
pub mod process_manager;
pub mod registry;
pub mod restart_queue;
pub mod runner;
pub mod runtime;
pub mod sharding;
pub mod store;
pub mod supervisor;
pub mod worker;
pub mod worker_process;

pub use config::Config;
pub use error::{Error, Result};
