// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON-RPC request/response envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version carried in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request body could not be parsed as JSON.
pub const PARSE_ERROR: i64 = -32700;
/// Request body was JSON but not a valid envelope.
pub const INVALID_REQUEST: i64 = -32600;
/// No handler is registered under the requested method name.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Handler rejected its params.
pub const INVALID_PARAMS: i64 = -32602;
/// Handler failed.
pub const INTERNAL_ERROR: i64 = -32603;
/// Token missing or not equal to the shared secret.
pub const INVALID_TOKEN: i64 = -32001;
/// Addressed entity (cluster, process) does not exist.
pub const NOT_FOUND: i64 = -32004;
/// Handler gave up waiting on a downstream process.
pub const TIMEOUT: i64 = -32008;

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// A method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Always `"2.0"`.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Registered method name.
    pub method: String,
    /// Method parameters (an object by convention).
    #[serde(default)]
    pub params: Value,
    /// Correlation id echoed in the response.
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    /// Build a request with a numeric correlation id.
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            params,
            id: Value::from(id),
        }
    }
}

/// The reply to an [`RpcRequest`]. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Always `"2.0"`.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Handler result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Handler error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Correlation id copied from the request.
    #[serde(default)]
    pub id: Value,
}

impl RpcResponse {
    /// Successful response.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Failed response.
    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Collapse the envelope into a `Result`.
    ///
    /// A response carrying neither field resolves to `null`, which is what a
    /// handler returning "nothing" looks like on the wire.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Error object carried in [`RpcResponse::error`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message, shown verbatim to operators.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create an error with the given code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The request body was not valid JSON.
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(PARSE_ERROR, format!("Parse error: {}", detail))
    }

    /// The body was JSON but not an envelope.
    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_REQUEST, format!("Invalid request: {}", detail))
    }

    /// No handler registered for `method`.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    /// Params failed validation.
    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, detail.to_string())
    }

    /// Authentication failed.
    pub fn invalid_token() -> Self {
        Self::new(INVALID_TOKEN, "Invalid token.")
    }

    /// Entity lookup failed.
    pub fn not_found(detail: impl std::fmt::Display) -> Self {
        Self::new(NOT_FOUND, detail.to_string())
    }

    /// Downstream did not answer in time.
    pub fn timeout(detail: impl std::fmt::Display) -> Self {
        Self::new(TIMEOUT, detail.to_string())
    }

    /// Anything else.
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, detail.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let request: RpcRequest = serde_json::from_value(json!({"method": "list"})).unwrap();
        assert_eq!(request.jsonrpc, "2.0");
        assert_eq!(request.params, Value::Null);
        assert_eq!(request.id, Value::Null);
    }

    #[test]
    fn test_response_omits_unset_fields() {
        let response = RpcResponse::success(json!(7), json!("OK"));
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded, json!({"jsonrpc": "2.0", "result": "OK", "id": 7}));
    }

    #[test]
    fn test_error_wins_over_result() {
        let response = RpcResponse {
            jsonrpc: "2.0".into(),
            result: Some(json!(1)),
            error: Some(RpcError::invalid_token()),
            id: json!(1),
        };
        assert_eq!(response.into_result(), Err(RpcError::invalid_token()));
    }

    #[test]
    fn test_empty_response_is_null() {
        let response: RpcResponse = serde_json::from_value(json!({"id": 3})).unwrap();
        assert_eq!(response.into_result(), Ok(Value::Null));
    }
}
