//! JSON-RPC 2.0 wire codec
//!
//! Turns raw JSON text into classified [`Frame`]s and back. Classification
//! is structural:
//!
//! - object with `method` and `id` → request
//! - object with `method`, no `id` → notification
//! - object with `id`, no `method` → response
//! - array → batch; each element classified independently, in order
//!
//! A frame carrying a `method` is never treated as a response, even when its
//! id matches an in-flight request: SSE servers may interleave
//! notifications that share the request id with the eventual response, and
//! the `method` field is the discriminator.
//!
//! The codec validates the protocol tag (`"2.0"`) and the id type (string or
//! integer only); `params` and `result` stay uninterpreted
//! [`serde_json::Value`]s for the engine layer to type.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, JsonRpcError, Result};
use crate::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION,
};

/// A classified JSON-RPC frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    /// Batch form; elements are processed in receive order.
    Batch(Vec<Frame>),
}

impl Frame {
    /// Serialize to a single-line JSON string (no interior newlines), the
    /// form every transport here puts on the wire.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and classify one frame of JSON text.
    pub fn decode(text: &str) -> Result<Frame> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::JsonRpc(JsonRpcError::parse_error(e.to_string())))?;
        classify(value)
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Frame::Response(_))
    }
}

impl From<JsonRpcRequest> for Frame {
    fn from(r: JsonRpcRequest) -> Self {
        Frame::Request(r)
    }
}

impl From<JsonRpcNotification> for Frame {
    fn from(n: JsonRpcNotification) -> Self {
        Frame::Notification(n)
    }
}

impl From<JsonRpcResponse> for Frame {
    fn from(r: JsonRpcResponse) -> Self {
        Frame::Response(r)
    }
}

/// Classify a parsed JSON value into a [`Frame`].
pub fn classify(value: Value) -> Result<Frame> {
    match value {
        Value::Array(elements) => {
            if elements.is_empty() {
                return Err(invalid("empty batch"));
            }
            // Batch elements are objects; batches do not nest.
            let frames = elements
                .into_iter()
                .map(|element| match element {
                    Value::Object(_) => classify(element),
                    _ => Err(invalid("batch element must be an object")),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Frame::Batch(frames))
        }
        Value::Object(ref map) => {
            match map.get("jsonrpc").and_then(Value::as_str) {
                Some(JSONRPC_VERSION) => {}
                Some(other) => {
                    return Err(invalid(format!("unsupported jsonrpc version '{other}'")))
                }
                None => return Err(invalid("missing jsonrpc version tag")),
            }

            let id = match map.get("id") {
                None | Some(Value::Null) => None,
                Some(raw) => Some(parse_id(raw)?),
            };
            let has_method = map.get("method").is_some();

            // `method` wins the classification; see module docs.
            match (has_method, id) {
                (true, Some(_)) => {
                    let req: JsonRpcRequest = serde_json::from_value(value)
                        .map_err(|e| invalid(e.to_string()))?;
                    Ok(Frame::Request(req))
                }
                (true, None) => {
                    let n: JsonRpcNotification =
                        serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
                    Ok(Frame::Notification(n))
                }
                (false, Some(_)) => {
                    if map.get("result").is_none() && map.get("error").is_none() {
                        return Err(invalid("response carries neither result nor error"));
                    }
                    let resp: JsonRpcResponse =
                        serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
                    Ok(Frame::Response(resp))
                }
                (false, None) => Err(invalid("frame has neither method nor id")),
            }
        }
        _ => Err(invalid("frame is neither object nor array")),
    }
}

/// Ids must be strings or integers, never null, floats, or structures.
fn parse_id(raw: &Value) -> Result<RequestId> {
    match raw {
        Value::String(s) => Ok(RequestId::String(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| invalid("request id must be an integer")),
        _ => Err(invalid("request id must be a string or integer")),
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::JsonRpc(JsonRpcError::invalid_request(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::methods;

    #[test]
    fn test_classify_request() {
        let f = Frame::decode(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        match f {
            Frame::Request(r) => {
                assert_eq!(r.method, "ping");
                assert_eq!(r.id, RequestId::Number(1));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification() {
        let f =
            Frame::decode(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(matches!(f, Frame::Notification(_)));
    }

    #[test]
    fn test_classify_response() {
        let f = Frame::decode(r#"{"jsonrpc":"2.0","id":"a","result":{}}"#).unwrap();
        assert!(matches!(f, Frame::Response(_)));
    }

    #[test]
    fn test_method_wins_over_id() {
        // A frame with both method and id is a request even if the id
        // matches something in flight.
        let f = Frame::decode(r#"{"jsonrpc":"2.0","id":1,"method":"notifications/progress","params":{"progressToken":1,"progress":0.5}}"#)
            .unwrap();
        assert!(matches!(f, Frame::Request(_)));
    }

    #[test]
    fn test_batch_preserves_order() {
        let f = Frame::decode(
            r#"[{"jsonrpc":"2.0","id":1,"method":"ping"},{"jsonrpc":"2.0","method":"notifications/initialized"}]"#,
        )
        .unwrap();
        match f {
            Frame::Batch(frames) => {
                assert_eq!(frames.len(), 2);
                assert!(matches!(frames[0], Frame::Request(_)));
                assert!(matches!(frames[1], Frame::Notification(_)));
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_version_tag_rejected() {
        let err = Frame::decode(r#"{"id":1,"method":"ping"}"#).unwrap_err();
        match err {
            Error::JsonRpc(e) => assert_eq!(e.code, -32600),
            other => panic!("expected invalid request, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = Frame::decode("{not json").unwrap_err();
        match err {
            Error::JsonRpc(e) => assert_eq!(e.code, -32700),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_float_id_rejected() {
        let err = Frame::decode(r#"{"jsonrpc":"2.0","id":1.5,"method":"ping"}"#).unwrap_err();
        match err {
            Error::JsonRpc(e) => assert_eq!(e.code, -32600),
            other => panic!("expected invalid request, got {other:?}"),
        }
    }

    #[test]
    fn test_null_id_with_method_is_notification() {
        let f = Frame::decode(r#"{"jsonrpc":"2.0","id":null,"method":"$/cancelled"}"#);
        // Null id is "no id": classified as a notification.
        assert!(matches!(f, Ok(Frame::Notification(_))));
    }

    #[test]
    fn test_response_without_result_or_error_rejected() {
        let err = Frame::decode(r#"{"jsonrpc":"2.0","id":4}"#).unwrap_err();
        assert!(matches!(err, Error::JsonRpc(_)));
    }

    #[test]
    fn test_encode_decode_identity() {
        let frames = [
            Frame::Request(
                JsonRpcRequest::new(9, methods::TOOLS_CALL)
                    .with_params(serde_json::json!({"name":"echo","arguments":{"message":"hi"}})),
            ),
            Frame::Notification(JsonRpcNotification::new("notifications/initialized")),
            Frame::Response(JsonRpcResponse::result(
                RequestId::String("r-1".into()),
                serde_json::json!({"tools": []}),
            )),
        ];
        for frame in frames {
            let encoded = frame.encode().unwrap();
            assert!(!encoded.contains('\n'));
            let decoded = Frame::decode(&encoded).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_string_and_number_ids_distinct() {
        let a = Frame::decode(r#"{"jsonrpc":"2.0","id":"7","result":{}}"#).unwrap();
        let b = Frame::decode(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#).unwrap();
        let (Frame::Response(ra), Frame::Response(rb)) = (a, b) else {
            panic!("expected responses");
        };
        assert_ne!(ra.id(), rb.id());
    }
}
