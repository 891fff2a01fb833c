//! JSON-RPC 2.0 message types, one message per line.
//!
//! Daemon failures use the server-defined code range. Their `data` member
//! carries the error `kind` and, for format failures, the `step` that failed.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{FormatError, StorageError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// The daemon-side error kind, if the server reported one.
    pub fn kind(&self) -> Option<&str> {
        self.data.as_ref()?.get("kind")?.as_str()
    }

    pub fn step(&self) -> Option<&str> {
        self.data.as_ref()?.get("step")?.as_str()
    }
}

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;

impl Response {
    pub fn success(id: Value, result: impl Serialize) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
            error: None,
            id,
        }
    }

    fn failure(id: Value, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message,
                data,
            }),
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self::failure(id, code, message.into(), None)
    }

    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, INVALID_REQUEST, "Invalid request")
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, details)
    }

    pub fn storage_error(id: Value, err: &StorageError) -> Self {
        Self::failure(
            id,
            err.code(),
            err.to_string(),
            Some(json!({ "kind": err.kind() })),
        )
    }

    pub fn format_error(id: Value, err: &FormatError) -> Self {
        Self::failure(
            id,
            err.source.code(),
            err.source.to_string(),
            Some(json!({ "kind": err.source.kind(), "step": err.step })),
        )
    }

    /// Collapse an operation result into a response.
    pub fn from_result<T: Serialize>(id: Value, result: Result<T, StorageError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(e) => Self::storage_error(id, &e),
        }
    }
}

impl Request {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::Number(1.into())),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != "2.0" {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}
