// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for shardline-management-sdk.

use shardline_protocol::ClientError;
use thiserror::Error;

/// Result type using SdkError.
pub type Result<T> = std::result::Result<T, SdkError>;

/// Errors that can occur when using the management SDK.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Configuration error (missing or invalid values).
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection to a control or RPC server failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Control server answered with a non-success status.
    #[error("control server returned {status}: {body}")]
    Http { status: u16, body: String },

    /// RPC server answered with an error object.
    #[error("server error [{code}]: {message}")]
    Server { code: i64, message: String },

    /// Token missing or rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Cluster or process not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unexpected response from server.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<ClientError> for SdkError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Rpc(e) if e.code == shardline_protocol::rpc::INVALID_TOKEN => {
                SdkError::Unauthorized(e.message)
            }
            ClientError::Rpc(e) if e.code == shardline_protocol::rpc::NOT_FOUND => {
                SdkError::NotFound(e.message)
            }
            ClientError::Rpc(e) => SdkError::Server {
                code: e.code,
                message: e.message,
            },
            ClientError::Json(e) => SdkError::Serialization(e.to_string()),
            ClientError::InvalidResponse(e) => SdkError::UnexpectedResponse(e),
            ClientError::Transport(e) => SdkError::Connection(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for SdkError {
    fn from(err: reqwest::Error) -> Self {
        SdkError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_protocol::RpcError;

    #[test]
    fn test_rpc_error_mapping() {
        let err: SdkError = ClientError::Rpc(RpcError::invalid_token()).into();
        assert!(matches!(err, SdkError::Unauthorized(ref m) if m == "Invalid token."));

        let err: SdkError = ClientError::Rpc(RpcError::not_found("Unable to find cluster 4")).into();
        assert!(matches!(err, SdkError::NotFound(ref m) if m == "Unable to find cluster 4"));

        let err: SdkError = ClientError::Rpc(RpcError::invalid_params("Invalid host.")).into();
        assert!(matches!(err, SdkError::Server { code: -32602, .. }));
    }
}
