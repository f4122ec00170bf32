// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC client/server tests over a loopback listener.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::body::Body;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use shardline_protocol::rpc::{INVALID_TOKEN, METHOD_NOT_FOUND};
use shardline_protocol::{
    ClientError, RpcClient, RpcError, RpcHandler, RpcMethods, RpcServer, handler_fn,
};
use tower::ServiceExt;

/// Handler that counts how often it ran.
#[derive(Default)]
struct SpyHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl RpcHandler for SpyHandler {
    async fn call(&self, params: Value) -> Result<Value, RpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"restarted": params.get("id").cloned().unwrap_or(Value::Null)}))
    }
}

fn methods_with_spy(spy: Arc<SpyHandler>) -> RpcMethods {
    RpcMethods::new()
        .register(
            "echo",
            handler_fn(|params| async move { Ok(params) }),
        )
        .register(
            "fail",
            handler_fn(|_| async { Err(RpcError::not_found("Cluster not found")) }),
        )
        .register_authenticated("restart", "s3cret", spy)
}

async fn start(methods: RpcMethods) -> (RpcServer, RpcClient) {
    let server = RpcServer::bind("127.0.0.1", 0, methods).await.unwrap();
    let client = RpcClient::new("127.0.0.1", server.local_addr().port());
    (server, client)
}

#[tokio::test]
async fn test_request_round_trip() {
    let (server, client) = start(methods_with_spy(Arc::default())).await;

    let result = client.request("echo", json!({"x": 1})).await.unwrap();
    assert_eq!(result, json!({"x": 1}));

    server.shutdown().await;
}

#[tokio::test]
async fn test_handler_error_reaches_caller() {
    let (server, client) = start(methods_with_spy(Arc::default())).await;

    let err = client.request("fail", json!({})).await.unwrap_err();
    assert_eq!(err.rpc_error().unwrap().message, "Cluster not found");

    let err = client.request("missing", json!({})).await.unwrap_err();
    assert_eq!(err.rpc_error().unwrap().code, METHOD_NOT_FOUND);

    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_token_never_invokes_handler() {
    let spy = Arc::new(SpyHandler::default());
    let (server, client) = start(methods_with_spy(spy.clone())).await;

    for params in [
        json!({"id": 1}),
        json!({"id": 1, "token": "wrong"}),
        json!({"id": 1, "token": 42}),
    ] {
        let err = client.request("restart", params).await.unwrap_err();
        let rpc = err.rpc_error().expect("auth failure is an RPC error");
        assert_eq!(rpc.code, INVALID_TOKEN);
        assert_eq!(rpc.message, "Invalid token.");
    }
    assert_eq!(spy.calls.load(Ordering::SeqCst), 0);

    let result = client
        .request("restart", json!({"id": 1, "token": "s3cret"}))
        .await
        .unwrap();
    assert_eq!(result, json!({"restarted": 1}));
    assert_eq!(spy.calls.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_typed_call() {
    let (server, client) = start(methods_with_spy(Arc::default())).await;

    let echoed: Vec<u32> = client.call("echo", &[1u32, 2, 3]).await.unwrap();
    assert_eq!(echoed, vec![1, 2, 3]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    let (server, client) = start(RpcMethods::new()).await;
    server.shutdown().await;

    let err = client.request("echo", json!({})).await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)));
}

#[tokio::test]
async fn test_errors_travel_with_200() {
    let app = methods_with_spy(Arc::default()).into_router();

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"jsonrpc": "2.0", "method": "restart", "params": {}, "id": 5})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["id"], json!(5));
    assert_eq!(body["error"]["code"], json!(INVALID_TOKEN));
    assert!(body.get("result").is_none());
}
