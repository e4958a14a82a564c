//! Error types for mcp-conduit
//!
//! ## JSON-RPC Error Codes
//!
//! Standard JSON-RPC 2.0 error codes are defined in the specification:
//! <https://www.jsonrpc.org/specification#error_object>
//!
//! | Code   | Message          | Meaning                                      |
//! |--------|------------------|----------------------------------------------|
//! | -32700 | Parse error      | Invalid JSON was received                    |
//! | -32600 | Invalid Request  | The JSON sent is not a valid Request         |
//! | -32601 | Method not found | The method does not exist / is not available |
//! | -32602 | Invalid params   | Invalid method parameter(s)                  |
//! | -32603 | Internal error   | Internal JSON-RPC error                      |
//!
//! Method-specific codes lie outside the reserved -32768..-32000 range.
//!
//! Everything else that can go wrong locally (a transport closing under a
//! request, an operation attempted before the handshake, a saturated send
//! buffer) is a variant of [`Error`] and never reaches the wire.

use serde::{Deserialize, Serialize};

use crate::protocol::RequestId;

/// Standard JSON-RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Invalid JSON was received
    ParseError = -32700,
    /// The JSON sent is not a valid Request object
    InvalidRequest = -32600,
    /// The method does not exist / is not available
    MethodNotFound = -32601,
    /// Invalid method parameter(s)
    InvalidParams = -32602,
    /// Internal JSON-RPC error
    InternalError = -32603,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method not found: {}", method),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// mcp-conduit error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer answered with a JSON-RPC error object.
    #[error("JSON-RPC error: {0}")]
    JsonRpc(JsonRpcError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation was attempted before the initialize handshake completed.
    /// Fails locally; nothing is sent.
    #[error("client not initialized")]
    NotInitialized,

    /// The request's deadline elapsed before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// The caller's cancellation signal fired before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// The underlying channel is gone. All in-flight requests fail; no retry.
    #[error("transport closed")]
    TransportClosed,

    /// The server no longer recognizes our session id. The caller must
    /// reinitialize.
    #[error("session lost; reinitialize required")]
    SessionLost,

    /// The transport's outbound buffer is saturated. The caller decides
    /// whether to retry or fail.
    #[error("transport send buffer full")]
    BackpressureFull,

    /// A request id collided with one still in flight on this connection.
    #[error("request id already in flight: {0:?}")]
    DuplicateId(RequestId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert into the JSON-RPC error object that goes on the wire when
    /// this error aborts an inbound request.
    pub fn to_json_rpc(&self) -> JsonRpcError {
        match self {
            Error::JsonRpc(e) => e.clone(),
            Error::Serialization(e) => JsonRpcError::invalid_params(e.to_string()),
            other => JsonRpcError::internal_error(other.to_string()),
        }
    }

    /// True for the two cancellation causes (explicit cancel and timeout).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout)
    }
}

impl From<JsonRpcError> for Error {
    fn from(err: JsonRpcError) -> Self {
        Error::JsonRpc(err)
    }
}

/// Result type alias for mcp-conduit
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_codes() {
        assert_eq!(ErrorCode::ParseError.code(), -32700);
        assert_eq!(ErrorCode::InvalidRequest.code(), -32600);
        assert_eq!(ErrorCode::MethodNotFound.code(), -32601);
        assert_eq!(ErrorCode::InvalidParams.code(), -32602);
        assert_eq!(ErrorCode::InternalError.code(), -32603);
    }

    #[test]
    fn test_error_object_roundtrip() {
        let err = JsonRpcError::method_not_found("tools/fly").with_data(serde_json::json!({
            "method": "tools/fly"
        }));
        let json = serde_json::to_string(&err).unwrap();
        let back: JsonRpcError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_data_omitted_when_none() {
        let err = JsonRpcError::invalid_request("bad frame");
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_to_json_rpc_preserves_peer_error() {
        let inner = JsonRpcError {
            code: -32050,
            message: "resource gone".into(),
            data: None,
        };
        let err = Error::JsonRpc(inner.clone());
        assert_eq!(err.to_json_rpc(), inner);
    }

    #[test]
    fn test_cancellation_causes() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::Timeout.is_cancellation());
        assert!(!Error::TransportClosed.is_cancellation());
    }
}
