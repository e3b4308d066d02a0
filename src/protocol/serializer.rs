//! Envelope encoding and decoding.
//!
//! The [`MessageSerializer`] trait keeps the wire format pluggable; the
//! host ships with [`JsonRpcSerializer`] for JSON-RPC 2.0. Decoding
//! inspects which members are present rather than relying on
//! `#[serde(untagged)]`, which cannot reliably tell a request from a
//! response. Unknown members are ignored.

use std::fmt;

use serde_json::{Map, Value};

use super::message::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, ResponsePayload,
};
use crate::error::{DeserializationError, SerializationError};

/// Converts envelopes to and from frame payloads.
pub trait MessageSerializer: Send + Sync + fmt::Debug {
    /// Encodes one envelope into a frame payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented in the format.
    fn encode(&self, message: &JsonRpcMessage) -> Result<Vec<u8>, SerializationError>;

    /// Decodes one frame payload into an envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`DeserializationError`] for truncated, invalid or
    /// unrecognised payloads.
    fn decode(&self, bytes: &[u8]) -> Result<JsonRpcMessage, DeserializationError>;

    /// Short format name for logs.
    fn format_name(&self) -> &'static str;
}

/// How strictly the `jsonrpc` member is checked on input.
///
/// Output always carries `"jsonrpc": "2.0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPolicy {
    /// Accept messages without a `jsonrpc` member.
    #[default]
    Lenient,
    /// Require `"jsonrpc": "2.0"`.
    Strict,
}

/// JSON-RPC 2.0 serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcSerializer {
    policy: VersionPolicy,
}

impl JsonRpcSerializer {
    /// Creates a serializer with the given version policy.
    #[must_use]
    pub const fn new(policy: VersionPolicy) -> Self {
        Self { policy }
    }

    /// Returns the version policy.
    #[must_use]
    pub const fn policy(&self) -> VersionPolicy {
        self.policy
    }

    fn check_version(&self, obj: &Map<String, Value>) -> Result<(), DeserializationError> {
        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => Ok(()),
            Some(other) => Err(DeserializationError::UnsupportedVersion(other.to_string())),
            None if self.policy == VersionPolicy::Lenient => Ok(()),
            None => Err(DeserializationError::UnsupportedVersion(
                "missing 'jsonrpc' member".to_string(),
            )),
        }
    }
}

impl MessageSerializer for JsonRpcSerializer {
    fn encode(&self, message: &JsonRpcMessage) -> Result<Vec<u8>, SerializationError> {
        let mut obj = Map::new();
        obj.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));

        match message {
            JsonRpcMessage::Request(req) => {
                obj.insert("id".to_string(), req.id.clone().into());
                obj.insert("method".to_string(), Value::from(req.method.as_str()));
                if let Some(ref params) = req.params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            JsonRpcMessage::Response(resp) => {
                obj.insert("id".to_string(), resp.id.clone().into());
                match &resp.payload {
                    ResponsePayload::Result(v) => {
                        obj.insert("result".to_string(), v.clone());
                    }
                    ResponsePayload::Error(e) => {
                        obj.insert("error".to_string(), encode_error(e));
                    }
                }
            }
            JsonRpcMessage::Notification(notif) => {
                obj.insert("method".to_string(), Value::from(notif.method.as_str()));
                if let Some(ref params) = notif.params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
        }

        Ok(serde_json::to_vec(&Value::Object(obj))?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<JsonRpcMessage, DeserializationError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(mut obj) = value else {
            return Err(DeserializationError::NotAnObject);
        };
        self.check_version(&obj)?;

        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");

        if has_result || has_error {
            if has_result && has_error {
                return Err(DeserializationError::InvalidField {
                    field: "result",
                    reason: "response carries both 'result' and 'error'".to_string(),
                });
            }
            let id = decode_id(obj.remove("id"))?;
            let payload = match obj.remove("result") {
                Some(result) => ResponsePayload::Result(result),
                None => ResponsePayload::Error(decode_error(obj.remove("error"))?),
            };
            return Ok(JsonRpcMessage::Response(JsonRpcResponse { id, payload }));
        }

        let method = match obj.remove("method") {
            Some(Value::String(m)) => m,
            Some(other) => {
                return Err(DeserializationError::InvalidField {
                    field: "method",
                    reason: format!("expected string, got {}", json_type(&other)),
                });
            }
            None => return Err(DeserializationError::UnknownShape),
        };
        let params = obj.remove("params");

        match obj.remove("id") {
            Some(id) => Ok(JsonRpcMessage::Request(JsonRpcRequest {
                id: decode_id(Some(id))?,
                method,
                params,
            })),
            None => Ok(JsonRpcMessage::Notification(JsonRpcNotification {
                method,
                params,
            })),
        }
    }

    fn format_name(&self) -> &'static str {
        "jsonrpc-2.0"
    }
}

fn decode_id(value: Option<Value>) -> Result<RequestId, DeserializationError> {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| DeserializationError::InvalidId(n.to_string())),
        Some(Value::String(s)) => Ok(RequestId::String(s)),
        Some(other) => Err(DeserializationError::InvalidId(other.to_string())),
        None => Err(DeserializationError::InvalidId("missing".to_string())),
    }
}

// Error objects are handled by hand so that `"data": null` survives a
// round trip instead of collapsing into `None`.
fn encode_error(error: &JsonRpcError) -> Value {
    let mut obj = Map::new();
    obj.insert("code".to_string(), Value::from(error.code));
    obj.insert("message".to_string(), Value::from(error.message.as_str()));
    if let Some(ref data) = error.data {
        obj.insert("data".to_string(), data.clone());
    }
    Value::Object(obj)
}

fn decode_error(value: Option<Value>) -> Result<JsonRpcError, DeserializationError> {
    let invalid = |reason: String| DeserializationError::InvalidField {
        field: "error",
        reason,
    };
    let Some(Value::Object(mut obj)) = value else {
        return Err(invalid("expected object".to_string()));
    };
    let code = obj
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid("'code' must be an integer".to_string()))?;
    let message = match obj.remove("message") {
        Some(Value::String(m)) => m,
        _ => return Err(invalid("'message' must be a string".to_string())),
    };
    Ok(JsonRpcError {
        code,
        message,
        data: obj.remove("data"),
    })
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{MessageKind, error_codes};
    use proptest::prelude::*;
    use serde_json::json;

    fn decode(s: &str) -> Result<JsonRpcMessage, DeserializationError> {
        JsonRpcSerializer::default().decode(s.as_bytes())
    }

    // ========================================================================
    // Shape detection
    // ========================================================================

    #[test]
    fn test_decode_request() {
        let msg = decode(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#).unwrap();
        match msg {
            JsonRpcMessage::Request(r) => {
                assert_eq!(r.id, RequestId::Number(1));
                assert_eq!(r.method, "initialize");
                assert_eq!(r.params, Some(json!({})));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_notification() {
        let msg = decode(r#"{"jsonrpc":"2.0","method":"exit"}"#).unwrap();
        assert_eq!(msg.kind(), MessageKind::Notification);
        assert_eq!(msg.method(), Some("exit"));
    }

    #[test]
    fn test_decode_response_with_null_result() {
        let msg = decode(r#"{"jsonrpc":"2.0","id":"a","result":null}"#).unwrap();
        match msg {
            JsonRpcMessage::Response(r) => {
                assert_eq!(r.result(), Some(&Value::Null));
                assert_eq!(r.id, RequestId::from("a"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_response() {
        let msg = decode(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"Method not found","data":{"m":"x"}}}"#,
        )
        .unwrap();
        let JsonRpcMessage::Response(r) = msg else {
            panic!("expected response");
        };
        let err = r.error_object().unwrap();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
        assert_eq!(err.data, Some(json!({"m": "x"})));
    }

    #[test]
    fn test_unknown_members_are_ignored() {
        let msg = decode(
            r#"{"jsonrpc":"2.0","id":9,"method":"objectexplorer/expand","params":[1],"trace":"verbose","x":{"y":1}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), MessageKind::Request);
        assert_eq!(msg.method(), Some("objectexplorer/expand"));
    }

    // ========================================================================
    // Rejections
    // ========================================================================

    #[test]
    fn test_rejects_truncated_payload() {
        let err = decode(r#"{"jsonrpc":"2.0","id":1,"meth"#).unwrap_err();
        assert!(matches!(err, DeserializationError::InvalidJson(_)));
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(
            decode("[1, 2, 3]").unwrap_err(),
            DeserializationError::NotAnObject
        ));
    }

    #[test]
    fn test_rejects_empty_object() {
        assert!(matches!(
            decode("{}").unwrap_err(),
            DeserializationError::UnknownShape
        ));
    }

    #[test]
    fn test_rejects_invalid_ids() {
        for payload in [
            r#"{"id":null,"method":"m"}"#,
            r#"{"id":1.5,"method":"m"}"#,
            r#"{"id":[1],"method":"m"}"#,
            r#"{"result":1}"#,
        ] {
            assert!(
                matches!(decode(payload).unwrap_err(), DeserializationError::InvalidId(_)),
                "payload should have an invalid id: {payload}"
            );
        }
    }

    #[test]
    fn test_rejects_non_string_method() {
        let err = decode(r#"{"id":1,"method":42}"#).unwrap_err();
        assert!(matches!(
            err,
            DeserializationError::InvalidField { field: "method", .. }
        ));
    }

    #[test]
    fn test_rejects_result_and_error_together() {
        let err = decode(r#"{"id":1,"result":1,"error":{"code":1,"message":"x"}}"#).unwrap_err();
        assert!(matches!(
            err,
            DeserializationError::InvalidField { field: "result", .. }
        ));
    }

    #[test]
    fn test_rejects_malformed_error_object() {
        let err = decode(r#"{"id":1,"error":{"message":"no code"}}"#).unwrap_err();
        assert!(matches!(
            err,
            DeserializationError::InvalidField { field: "error", .. }
        ));
    }

    // ========================================================================
    // Version policy
    // ========================================================================

    #[test]
    fn test_lenient_accepts_missing_version() {
        assert!(decode(r#"{"id":1,"method":"m"}"#).is_ok());
    }

    #[test]
    fn test_strict_requires_version() {
        let strict = JsonRpcSerializer::new(VersionPolicy::Strict);
        let err = strict.decode(br#"{"id":1,"method":"m"}"#).unwrap_err();
        assert!(matches!(err, DeserializationError::UnsupportedVersion(_)));
        assert!(strict.decode(br#"{"jsonrpc":"2.0","id":1,"method":"m"}"#).is_ok());
    }

    #[test]
    fn test_wrong_version_rejected_in_both_policies() {
        let err = decode(r#"{"jsonrpc":"1.0","id":1,"method":"m"}"#).unwrap_err();
        assert!(matches!(err, DeserializationError::UnsupportedVersion(_)));
    }

    // ========================================================================
    // Encoding format
    // ========================================================================

    #[test]
    fn test_encode_request_format() {
        let msg = JsonRpcMessage::Request(JsonRpcRequest::new(0, "initialize", Some(json!({}))));
        let bytes = JsonRpcSerializer::default().encode(&msg).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, json!({"jsonrpc": "2.0", "id": 0, "method": "initialize", "params": {}}));
    }

    #[test]
    fn test_encode_omits_absent_params() {
        let msg = JsonRpcMessage::Notification(JsonRpcNotification::new("exit", None));
        let bytes = JsonRpcSerializer::default().encode(&msg).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(parsed.get("params").is_none());
        assert!(parsed.get("id").is_none());
    }

    #[test]
    fn test_encode_error_response_has_no_result() {
        let msg = JsonRpcMessage::Response(JsonRpcResponse::error(
            RequestId::Number(2),
            JsonRpcError::new(error_codes::METHOD_NOT_FOUND, "method not found: notARealMethod"),
        ));
        let bytes = JsonRpcSerializer::default().encode(&msg).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(parsed.get("result").is_none());
        assert_eq!(parsed["error"]["code"], -32601);
        assert_eq!(parsed["id"], 2);
    }

    // ========================================================================
    // Round trip
    // ========================================================================

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z0-9 ]{0,12}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn arb_id() -> impl Strategy<Value = RequestId> {
        prop_oneof![
            any::<i64>().prop_map(RequestId::Number),
            "[a-zA-Z0-9-]{0,16}".prop_map(RequestId::String),
        ]
    }

    fn arb_message() -> impl Strategy<Value = JsonRpcMessage> {
        let method = "[a-z/$]{1,24}";
        prop_oneof![
            (arb_id(), method, prop::option::of(arb_json())).prop_map(|(id, m, p)| {
                JsonRpcMessage::Request(JsonRpcRequest {
                    id,
                    method: m,
                    params: p,
                })
            }),
            (method, prop::option::of(arb_json()))
                .prop_map(|(m, p)| JsonRpcMessage::Notification(JsonRpcNotification::new(m, p))),
            (arb_id(), arb_json())
                .prop_map(|(id, v)| JsonRpcMessage::Response(JsonRpcResponse::success(id, v))),
            (arb_id(), any::<i64>(), ".{0,16}", prop::option::of(arb_json())).prop_map(
                |(id, code, message, data)| {
                    JsonRpcMessage::Response(JsonRpcResponse::error(
                        id,
                        JsonRpcError {
                            code,
                            message,
                            data,
                        },
                    ))
                }
            ),
        ]
    }

    proptest! {
        #[test]
        fn test_decode_inverts_encode(msg in arb_message()) {
            let serializer = JsonRpcSerializer::default();
            let bytes = serializer.encode(&msg).unwrap();
            prop_assert_eq!(serializer.decode(&bytes).unwrap(), msg);
        }
    }
}
