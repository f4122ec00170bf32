// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shardline Management SDK
//!
//! Client for operating a shardline fleet.
//!
//! # Architecture
//!
//! The SDK talks to three servers:
//! - Control HTTP server (direct topology): diagnostics, restarts,
//!   broadcasts, module reloads
//! - Cluster manager RPC (hosted topology): restarts, cluster moves,
//!   cluster creation
//! - Process manager RPC (one per host): process listing and restarts
//!
//! # Example
//!
//! ```no_run
//! use shardline_management_sdk::{ManagementSdk, RestartTarget, SdkConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sdk = ManagementSdk::new(SdkConfig::new().with_restart_token("secret"))?;
//!
//! println!("{}", sdk.ping().await?);
//! for answer in sdk.shards().await? {
//!     println!("{}: {:?}", answer.id, answer.result);
//! }
//!
//! sdk.restart(RestartTarget::Cluster(3)).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod types;

pub use client::ManagementSdk;
pub use config::SdkConfig;
pub use error::{Result, SdkError};
pub use types::{ProcessInfo, RestartTarget, WorkerAnswer};
