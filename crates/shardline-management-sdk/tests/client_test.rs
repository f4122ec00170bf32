// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ManagementSdk against loopback control and RPC servers.

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde_json::{Value, json};
use shardline_management_sdk::{ManagementSdk, RestartTarget, SdkConfig, SdkError};
use shardline_protocol::{RpcError, RpcMethods, RpcServer, handler_fn};

/// Control server stub recording POST bodies.
async fn control_stub(bodies: Arc<Mutex<Vec<Value>>>) -> String {
    let record = move |bodies: Arc<Mutex<Vec<Value>>>| {
        move |body: String| {
            let bodies = bodies.clone();
            async move {
                let value: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                bodies.lock().unwrap().push(value);
                "OK"
            }
        }
    };

    let app = Router::new()
        .route("/ping", get(|| async { "Pong!" }))
        .route(
            "/shards",
            get(|| async { r#"[{"id":0,"result":{"shards":[0,1]}},{"id":1,"error":"timeout"}]"# }),
        )
        .route(
            "/restart",
            post(|body: String| async move {
                let body: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                match (body["token"].as_str(), body["id"].as_u64()) {
                    (Some("secret"), Some(0)) => (StatusCode::OK, "OK"),
                    (Some("secret"), _) => (StatusCode::NOT_FOUND, "Cluster not found"),
                    _ => (StatusCode::FORBIDDEN, "Forbidden"),
                }
            }),
        )
        .route("/guildUpdate", post(record(bodies.clone())))
        .route("/reload", post(record(bodies)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn process(id: u32) -> Value {
    json!({
        "id": format!("00000000-0000-4000-8000-00000000000{}", id),
        "pid": 4000 + id,
        "port": 30000 + id,
        "options": {"role": "cluster", "cluster": {"id": id}},
        "createdAt": "2025-06-01T12:00:00Z"
    })
}

async fn manager_stub() -> RpcServer {
    let methods = RpcMethods::new()
        .register(
            "createCluster",
            handler_fn(|params| async move {
                match params["id"].as_u64() {
                    Some(id) if id < 4 => Ok(process(id as u32)),
                    Some(id) => Err(RpcError::not_found(format!("Unable to find cluster {}", id))),
                    None => Err(RpcError::invalid_params("Missing ID")),
                }
            }),
        )
        .register_authenticated(
            "moveCluster",
            "secret",
            handler_fn(|_| async { Ok(json!("OK")) }),
        );
    RpcServer::bind("127.0.0.1", 0, methods).await.unwrap()
}

async fn process_manager_stub() -> RpcServer {
    let methods = RpcMethods::new()
        .register("list", handler_fn(|_| async { Ok(json!([process(0), process(1)])) }))
        .register("restartManager", handler_fn(|_| async { Ok(json!("OK")) }));
    RpcServer::bind("127.0.0.1", 0, methods).await.unwrap()
}

#[tokio::test]
async fn test_control_server_operations() {
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let url = control_stub(bodies.clone()).await;
    let sdk = ManagementSdk::new(
        SdkConfig::new()
            .with_control_url(url)
            .with_restart_token("secret"),
    )
    .unwrap();

    assert_eq!(sdk.ping().await.unwrap(), "Pong!");

    let shards = sdk.shards().await.unwrap();
    assert_eq!(shards.len(), 2);
    assert!(shards[0].is_ok());
    assert_eq!(shards[1].error.as_deref(), Some("timeout"));

    sdk.restart(RestartTarget::Cluster(0)).await.unwrap();
    assert!(matches!(
        sdk.restart(RestartTarget::Cluster(9)).await,
        Err(SdkError::NotFound(ref body)) if body == "Cluster not found"
    ));

    sdk.guild_update(json!({"guilds": 12})).await.unwrap();
    sdk.reload("logger").await.unwrap();
    assert_eq!(
        *bodies.lock().unwrap(),
        vec![json!({"guilds": 12}), json!({"c": "logger"})]
    );
}

#[tokio::test]
async fn test_control_restart_with_wrong_token() {
    let url = control_stub(Arc::new(Mutex::new(Vec::new()))).await;
    let sdk = ManagementSdk::new(
        SdkConfig::new()
            .with_control_url(url)
            .with_restart_token("guess"),
    )
    .unwrap();

    assert!(matches!(
        sdk.restart(RestartTarget::All).await,
        Err(SdkError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn test_manager_and_process_manager_operations() {
    let manager = manager_stub().await;
    let processes = process_manager_stub().await;
    let config = SdkConfig::new()
        .with_rpc_host("127.0.0.1")
        .with_manager_port(manager.local_addr().port())
        .with_process_manager_port(processes.local_addr().port())
        .with_rpc_token("secret");
    let sdk = ManagementSdk::new(config.clone()).unwrap();

    let created = sdk.create_cluster(2).await.unwrap();
    assert_eq!(created.cluster_id(), Some(2));
    assert!(matches!(
        sdk.create_cluster(8).await,
        Err(SdkError::NotFound(ref message)) if message == "Unable to find cluster 8"
    ));

    sdk.move_cluster(1, "titan").await.unwrap();
    let wrong = ManagementSdk::new(config.with_rpc_token("nope")).unwrap();
    assert!(matches!(
        wrong.move_cluster(1, "titan").await,
        Err(SdkError::Unauthorized(_))
    ));

    let listed = sdk.list_processes().await.unwrap();
    assert_eq!(
        listed.iter().map(|p| p.cluster_id()).collect::<Vec<_>>(),
        vec![Some(0), Some(1)]
    );
    sdk.restart_manager().await.unwrap();

    manager.shutdown().await;
    processes.shutdown().await;
}
