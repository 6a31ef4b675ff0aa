use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{codes, BridgeError};

/// The only protocol version this server speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request. A missing `id` marks a notification; an explicit
/// `"id": null` is still a request and decodes as `Some(Value::Null)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default, deserialize_with = "present_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Only reached when the field is present, so `null` stays distinguishable from absent.
fn present_id<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl RpcRequest {
    pub fn new<S: Into<String>>(id: Value, method: S, params: Map<String, Value>) -> Self {
        RpcRequest { jsonrpc: JSONRPC_VERSION.to_string(), id: Some(id), method: method.into(), params }
    }

    pub fn is_notification(&self) -> bool { self.id.is_none() }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 response. Exactly one of `result`/`error` is set by the
/// constructors; a `null` result decodes as an absent one and is treated as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        RpcResponse { jsonrpc: JSONRPC_VERSION.to_string(), id, result: Some(result), error: None }
    }

    pub fn failure<S: Into<String>>(id: Value, code: i64, message: S) -> Self {
        RpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcErrorObject { code, message: message.into(), data: None }),
        }
    }

    pub fn from_bridge_error(id: Value, err: BridgeError) -> Self { Self::failure(id, err.code, err.message) }

    pub fn is_error(&self) -> bool { self.error.is_some() }

    /// Unpack into the carried result, or the embedded error with code and
    /// message untouched.
    pub fn into_result(self) -> Result<Value, BridgeError> {
        match self.error {
            Some(err) => Err(BridgeError::new(err.code, err.message)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Decode a request body. Failures come back as ready-to-send error responses.
pub fn parse_request(body: &[u8]) -> Result<RpcRequest, RpcResponse> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RpcResponse::failure(Value::Null, codes::PARSE_ERROR, format!("parse error: {e}")))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    if !value.is_object() {
        return Err(RpcResponse::failure(id, codes::INVALID_REQUEST, "request must be a JSON object"));
    }
    if let Some(params) = value.get("params") {
        if !params.is_object() && !params.is_null() {
            return Err(RpcResponse::failure(id, codes::INVALID_PARAMS, "params must be an object"));
        }
    }
    let mut value = value;
    if value.get("params").map(|p| p.is_null()).unwrap_or(false) {
        if let Some(obj) = value.as_object_mut() { obj.remove("params"); }
    }
    let req: RpcRequest = serde_json::from_value(value)
        .map_err(|e| RpcResponse::failure(id.clone(), codes::INVALID_REQUEST, format!("invalid request: {e}")))?;
    if req.jsonrpc != JSONRPC_VERSION {
        return Err(RpcResponse::failure(
            id,
            codes::INVALID_REQUEST,
            format!("unsupported jsonrpc version: {}", req.jsonrpc),
        ));
    }
    Ok(req)
}
