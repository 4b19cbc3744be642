//! Shared frame model, RPC message shapes and codecs for the background link.
//!
//! This crate owns the wire representation used by both peers of a link. Frame
//! payloads stay flexible (`serde_json::Value`); a frame travels either as JSON
//! text or as protobuf bytes with the payload carried as a `google.protobuf.Value`.
//!
//! MESSAGE SHAPES
//! ==============
//! - request: `{id, method, params}`
//! - response: `{id, result}` or `{id, error: {message, code?, data?}}`
//! - event: `{method, params}` with no `id`

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error returned by the frame codecs and [`classify`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The text could not be parsed as a JSON frame.
    #[error("failed to parse json frame: {0}")]
    Json(#[from] serde_json::Error),
    /// The payload is neither a request, a response nor an event.
    #[error("unrecognized rpc message: {0}")]
    Unrecognized(String),
}

// =============================================================================
// FRAME
// =============================================================================

/// A single unit on the transport: a payload addressed to a named sub-channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Name of the virtual channel this frame belongs to.
    pub name: String,
    /// Opaque structured payload.
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    #[must_use]
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self { name: name.into(), data }
    }
}

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let wire = frame_to_wire(frame);

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec cannot fail; prost only reports
    // `BufferTooSmall`.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    Ok(wire_to_frame(wire))
}

/// Encode a frame as a JSON text message.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if the payload cannot be serialized.
pub fn encode_frame_json(frame: &Frame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a JSON text message into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for malformed text or a missing `name`.
pub fn decode_frame_json(text: &str) -> Result<Frame, CodecError> {
    Ok(serde_json::from_str(text)?)
}

fn frame_to_wire(frame: &Frame) -> WireFrame {
    WireFrame { name: frame.name.clone(), data: Some(json_to_proto_value(&frame.data)) }
}

fn wire_to_frame(wire: WireFrame) -> Frame {
    Frame { name: wire.name, data: wire.data.map_or(Value::Null, |v| proto_to_json_value(&v)) }
}

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => prost_types::value::Kind::NullValue(prost_types::NullValue::NullValue as i32),
        Value::Bool(v) => prost_types::value::Kind::BoolValue(*v),
        Value::Number(v) => prost_types::value::Kind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => prost_types::value::Kind::StringValue(v.clone()),
        Value::Array(v) => prost_types::value::Kind::ListValue(prost_types::ListValue {
            values: v.iter().map(json_to_proto_value).collect(),
        }),
        Value::Object(v) => prost_types::value::Kind::StructValue(prost_types::Struct {
            fields: v
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };

    prost_types::Value { kind: Some(kind) }
}

fn proto_to_json_value(value: &prost_types::Value) -> Value {
    let Some(kind) = &value.kind else {
        return Value::Null;
    };

    match kind {
        prost_types::value::Kind::NullValue(_) => Value::Null,
        prost_types::value::Kind::NumberValue(v) => proto_number(*v),
        prost_types::value::Kind::StringValue(v) => Value::String(v.clone()),
        prost_types::value::Kind::BoolValue(v) => Value::Bool(*v),
        prost_types::value::Kind::StructValue(v) => Value::Object(
            v.fields
                .iter()
                .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                .collect(),
        ),
        prost_types::value::Kind::ListValue(v) => Value::Array(v.values.iter().map(proto_to_json_value).collect()),
    }
}

/// Protobuf numbers are doubles. Integral values within the exactly
/// representable range come back as JSON integers.
#[allow(clippy::cast_possible_truncation)]
fn proto_number(v: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if v.fract() == 0.0 && v.abs() <= MAX_EXACT {
        return Value::from(v as i64);
    }
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(message, optional, tag = "2")]
    data: Option<prost_types::Value>,
}

// =============================================================================
// RPC MESSAGES
// =============================================================================

/// Outbound call: `{id, method, params}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Error object carried by a failed response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteFault {
    /// Read an `error` member of any shape. Objects keep whatever `message`,
    /// `code` and `data` they carry; anything else becomes the message text.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self { message: message.clone(), code: None, data: None },
            Value::Object(obj) => {
                let code = obj.get("code").and_then(Value::as_i64);
                let message = match obj.get("message").and_then(Value::as_str) {
                    Some(message) => message.to_owned(),
                    None => code.map_or_else(|| value.to_string(), |code| format!("remote error {code}")),
                };
                let data = obj.get("data").filter(|data| !data.is_null()).cloned();
                Self { message, code, data }
            }
            other => Self { message: other.to_string(), code: None, data: None },
        }
    }
}

/// Reply to a request, correlated by `id`.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcResponse {
    pub id: String,
    pub outcome: Result<Value, RemoteFault>,
}

/// Unsolicited push notification: `{method, params}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcEvent {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Any message carried on an RPC channel.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
    Event(RpcEvent),
}

impl RpcRequest {
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "method": self.method,
            "params": self.params,
        })
    }
}

impl RpcResponse {
    #[must_use]
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self { id: id.into(), outcome: Ok(result) }
    }

    #[must_use]
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { id: id.into(), outcome: Err(RemoteFault { message: message.into(), code: None, data: None }) }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), Value::String(self.id.clone()));
        match &self.outcome {
            Ok(result) => {
                map.insert("result".into(), result.clone());
            }
            Err(fault) => {
                map.insert("error".into(), fault_to_value(fault));
            }
        }
        Value::Object(map)
    }
}

impl RpcEvent {
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "method": self.method, "params": self.params })
    }
}

fn fault_to_value(fault: &RemoteFault) -> Value {
    let mut map = Map::new();
    map.insert("message".into(), Value::String(fault.message.clone()));
    if let Some(code) = fault.code {
        map.insert("code".into(), Value::from(code));
    }
    if let Some(data) = &fault.data {
        map.insert("data".into(), data.clone());
    }
    Value::Object(map)
}

/// Classify an inbound RPC channel payload.
///
/// A message with an `id` and a `method` is a request, an `id` alone makes a
/// response, and a `method` without an `id` is an event. Numeric ids are
/// normalized to their decimal string. Non-array `params` become a single
/// positional argument, and an `error` of any shape fails the response.
///
/// # Errors
///
/// Returns [`CodecError::Unrecognized`] when the payload fits none of the
/// shapes.
pub fn classify(payload: &Value) -> Result<RpcMessage, CodecError> {
    let Some(obj) = payload.as_object() else {
        return Err(CodecError::Unrecognized(format!("expected object, got {payload}")));
    };

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => return Err(CodecError::Unrecognized(format!("invalid id: {other}"))),
    };
    let method = obj.get("method").and_then(Value::as_str).map(str::to_owned);
    let params = match obj.get("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    };

    match (id, method) {
        (Some(id), Some(method)) => Ok(RpcMessage::Request(RpcRequest { id, method, params })),
        (Some(id), None) => {
            let outcome = match obj.get("error") {
                Some(err) if !err.is_null() => Err(RemoteFault::from_value(err)),
                _ => Ok(obj.get("result").cloned().unwrap_or(Value::Null)),
            };
            Ok(RpcMessage::Response(RpcResponse { id, outcome }))
        }
        (None, Some(method)) => Ok(RpcMessage::Event(RpcEvent { method, params })),
        (None, None) => Err(CodecError::Unrecognized(payload.to_string())),
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
