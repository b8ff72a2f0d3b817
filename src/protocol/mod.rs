//! Node bridge wire protocol.
//!
//! One JSON object per line, discriminated by `type`. Frames never carry
//! sequence numbers; ordering is the byte-stream order.
//!
//! Frame types:
//! - `hello` / `pair-request` -- node → gateway identity announcement
//! - `hello-ok` / `pair-ok`   -- gateway → node handshake outcome
//! - `ping` / `pong`          -- peer-driven keepalive
//! - `req` / `res`            -- node → gateway RPC and its reply
//! - `invoke` / `invoke-res`  -- gateway → node command and its reply
//! - `event`                  -- one-way notification
//! - `error`                  -- gateway-reported failure

pub mod codec;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use codec::{decode_line, encode_frame, CodecError, FrameDecoder};

// Error codes carried in `res` / `invoke-res` / `error` frames.
pub const ERROR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERROR_UNAVAILABLE: &str = "UNAVAILABLE";
pub const ERROR_NOT_PAIRED: &str = "NOT_PAIRED";
pub const ERROR_UNAUTHORIZED: &str = "UNAUTHORIZED";

/// Structured error attached to replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ERROR_INVALID_REQUEST, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ERROR_UNAVAILABLE, message)
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Identity fields announced by the node in `hello` and `pair-request`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<HashMap<String, bool>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloFrame {
    #[serde(flatten)]
    pub identity: NodeIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Handshake acceptance. The gateway may attach arbitrary metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOkFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRequestFrame {
    #[serde(flatten)]
    pub identity: NodeIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairOkFrame {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingFrame {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub event: String,
    #[serde(rename = "payloadJSON", default, skip_serializing_if = "Option::is_none")]
    pub payload_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(rename = "paramsJSON", default, skip_serializing_if = "Option::is_none")]
    pub params_json: Option<String>,
}

/// Reply shape shared by `res` and `invoke-res`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(rename = "payloadJSON", default, skip_serializing_if = "Option::is_none")]
    pub payload_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: &Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload_json: Some(payload.to_string()),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload_json: None,
            error: Some(error),
        }
    }

    /// Parse `payloadJSON`, treating a missing payload as `null`.
    pub fn payload(&self) -> Value {
        parse_json_field(self.payload_json.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeFrame {
    pub id: String,
    pub command: String,
    #[serde(rename = "paramsJSON", default, skip_serializing_if = "Option::is_none")]
    pub params_json: Option<String>,
}

impl InvokeFrame {
    pub fn params(&self) -> Value {
        parse_json_field(self.params_json.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
}

/// Every frame shape the bridge understands.
///
/// `Unknown` absorbs any other discriminant so newer peers never break an
/// older node; it is dropped by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    Hello(HelloFrame),
    HelloOk(HelloOkFrame),
    PairRequest(PairRequestFrame),
    PairOk(PairOkFrame),
    Ping(PingFrame),
    Pong(PingFrame),
    Event(EventFrame),
    Req(RequestFrame),
    Res(ResponseFrame),
    Invoke(InvokeFrame),
    InvokeRes(ResponseFrame),
    Error(ErrorFrame),
    #[serde(other)]
    Unknown,
}

impl Frame {
    /// Wire discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::HelloOk(_) => "hello-ok",
            Frame::PairRequest(_) => "pair-request",
            Frame::PairOk(_) => "pair-ok",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
            Frame::Event(_) => "event",
            Frame::Req(_) => "req",
            Frame::Res(_) => "res",
            Frame::Invoke(_) => "invoke",
            Frame::InvokeRes(_) => "invoke-res",
            Frame::Error(_) => "error",
            Frame::Unknown => "unknown",
        }
    }
}

fn parse_json_field(raw: Option<&str>) -> Value {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hello_wire_shape() {
        let frame = Frame::Hello(HelloFrame {
            identity: NodeIdentity {
                node_id: "node-1".to_string(),
                display_name: Some("Build box".to_string()),
                platform: Some("linux".to_string()),
                version: None,
                caps: vec!["system".to_string()],
                commands: vec!["system.run".to_string()],
                permissions: None,
            },
            token: Some("tok".to_string()),
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "hello",
                "nodeId": "node-1",
                "displayName": "Build box",
                "platform": "linux",
                "caps": ["system"],
                "commands": ["system.run"],
                "token": "tok"
            })
        );
    }

    #[test]
    fn test_pair_request_has_no_token() {
        let frame = Frame::PairRequest(PairRequestFrame {
            identity: NodeIdentity {
                node_id: "n".to_string(),
                ..Default::default()
            },
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "pair-request");
        assert!(value.get("token").is_none());
    }

    #[test]
    fn test_kebab_case_discriminants() {
        let res = Frame::InvokeRes(ResponseFrame::ok("1", &json!({"a": 1})));
        assert_eq!(serde_json::to_value(&res).unwrap()["type"], "invoke-res");
        let ok = Frame::HelloOk(HelloOkFrame::default());
        assert_eq!(serde_json::to_value(&ok).unwrap()["type"], "hello-ok");
    }

    #[test]
    fn test_hello_ok_keeps_metadata() {
        let frame: Frame =
            serde_json::from_value(json!({"type": "hello-ok", "serverName": "gw", "protocol": 3}))
                .unwrap();
        let Frame::HelloOk(ok) = frame else {
            panic!("expected hello-ok");
        };
        assert_eq!(ok.server_name.as_deref(), Some("gw"));
        assert_eq!(ok.meta.get("protocol"), Some(&json!(3)));
    }

    #[test]
    fn test_unknown_type_maps_to_unknown() {
        let frame: Frame =
            serde_json::from_value(json!({"type": "presence", "whatever": true})).unwrap();
        assert_eq!(frame, Frame::Unknown);
    }

    #[test]
    fn test_response_payload_parsing() {
        let res = ResponseFrame::ok("id", &json!({"bins": ["git"]}));
        assert_eq!(res.payload(), json!({"bins": ["git"]}));

        let bad = ResponseFrame {
            id: "x".to_string(),
            ok: true,
            payload_json: Some("{not json".to_string()),
            error: None,
        };
        assert_eq!(bad.payload(), Value::Null);
    }

    #[test]
    fn test_error_shape_display() {
        let err = ErrorShape::unavailable("SYSTEM_RUN_DENIED: allowlist-miss");
        assert_eq!(err.to_string(), "UNAVAILABLE: SYSTEM_RUN_DENIED: allowlist-miss");
    }
}
