//! JSON-RPC 2.0 envelope and response types.
//!
//! A single [`RpcMessage`] shape covers requests, notifications, and
//! responses; classification happens at dispatch time from which fields are
//! present. Ids, params, and results are held as [`RawValue`] so the bytes a
//! peer sent are preserved verbatim through correlation and forwarding.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::{AppError, Result};

/// The only supported JSON-RPC version.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes.
pub const ERR_PARSE: i64 = -32700;
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Generic JSON-RPC envelope for requests, notifications, and responses.
///
/// An envelope is a *request* when `method` is non-empty and a non-null `id`
/// is present, a *notification* when `method` is non-empty without an id, and
/// a *response* when `method` is empty and an id is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcMessage {
    /// Whether the envelope carries a usable (present and non-null) id.
    #[must_use]
    pub fn has_id(&self) -> bool {
        self.id.as_deref().is_some_and(|id| id.get() != "null")
    }
}

/// A JSON-RPC response ready for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Build a result response by serializing `value`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] if `value` cannot be serialized.
    pub fn from_value(id: Option<Box<RawValue>>, value: impl Serialize) -> Result<Self> {
        let result = serde_json::value::to_raw_value(&value)
            .map_err(|err| AppError::Rpc(format!("marshal result: {err}")))?;
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        })
    }

    /// Build a result response passing pre-serialized JSON through untouched.
    #[must_use]
    pub fn from_raw(id: Option<Box<RawValue>>, result: Box<RawValue>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build a `"result": null` response.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] if serialization fails.
    pub fn null(id: Option<Box<RawValue>>) -> Result<Self> {
        Self::from_value(id, serde_json::Value::Null)
    }

    /// Build an error response with the given code and message.
    #[must_use]
    pub fn error(id: Option<Box<RawValue>>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Build a response forwarding a downstream error object verbatim.
    #[must_use]
    pub fn from_error(id: Option<Box<RawValue>>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}
