// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shardline Protocol - command/control wire layer
//!
//! This crate provides the two transports used between shardline processes:
//! - JSON-RPC over HTTP between the cluster manager, the per-host process
//!   managers, the worker RPC servers and operator tooling
//! - Line-delimited JSON over a child's stdin/stdout between a supervisor
//!   and the worker processes it spawned (IPC)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    shardline-protocol                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC: RpcRequest/RpcResponse envelope, method dispatch,     │
//! │       token-authenticated methods                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  IPC: WorkerMessage / ManagerMessage (closed op sets)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: HTTP (axum server, reqwest client) | pipes      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Wire compatibility
//!
//! The RPC server always answers a well-formed HTTP request with `200 OK`;
//! success or failure travels in the `result` / `error` fields of the body.
//!
//! # Usage
//!
//! ```ignore
//! use serde_json::json;
//! use shardline_protocol::{RpcClient, RpcMethods, RpcServer, handler_fn};
//!
//! let methods = RpcMethods::new()
//!     .register("list", handler_fn(|_params| async { Ok(json!([])) }));
//! let server = RpcServer::bind("127.0.0.1", 5050, methods).await?;
//!
//! let client = RpcClient::new("127.0.0.1", 5050);
//! let processes = client.request("list", json!({})).await?;
//! ```

pub mod client;
pub mod ipc;
pub mod rpc;
pub mod server;

pub use client::{ClientError, RpcClient, RpcClientConfig};
pub use ipc::{
    DiagnosticQuery, Incoming, IpcError, IpcMessage, IpcReader, IpcWriter, ManagerMessage,
    QueryRequest, Reply, ReplyError, ShardDisconnect, WorkerMessage,
};
pub use rpc::{RpcError, RpcRequest, RpcResponse};
pub use server::{
    Authenticated, FnHandler, RpcHandler, RpcMethods, RpcServer, ServerError, handler_fn,
};
