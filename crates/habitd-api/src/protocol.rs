//! JSON-RPC 2.0 protocol types
//!
//! Self-contained implementation without external JSON-RPC libraries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Must be "2.0"
    pub jsonrpc: String,
    /// Method name, e.g. "responses.create"
    pub method: String,
    /// Request parameters (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request ID (string, number, or null)
    pub id: RequestId,
}

/// JSON-RPC request ID
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
    Null,
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// A JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: RequestId,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Response { jsonrpc: JSONRPC_VERSION.to_string(), result: Some(result), error: None, id }
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error.into_object()),
            id,
        }
    }
}

/// Wire representation of an error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Protocol and application error kinds
#[derive(Debug, Clone)]
pub enum RpcError {
    ParseError(String),
    InvalidRequest(String),
    MethodNotFound(String),
    InvalidParams(String),
    Internal(String),
    /// Application-level failure (entity not found, rejected input)
    App(String),
}

impl RpcError {
    pub fn into_object(self) -> ErrorObject {
        let (code, message) = match self {
            RpcError::ParseError(m) => (-32700, format!("Parse error: {}", m)),
            RpcError::InvalidRequest(m) => (-32600, format!("Invalid request: {}", m)),
            RpcError::MethodNotFound(m) => (-32601, format!("Method not found: {}", m)),
            RpcError::InvalidParams(m) => (-32602, format!("Invalid params: {}", m)),
            RpcError::Internal(m) => (-32603, format!("Internal error: {}", m)),
            RpcError::App(m) => (-32000, m),
        };
        ErrorObject { code, message, data: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_parsing() {
        let raw = r#"{"jsonrpc":"2.0","method":"reminders.upcoming","params":{"userId":"u1"},"id":7}"#;
        let request: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(request.method, "reminders.upcoming");
        assert_eq!(request.id, RequestId::Number(7));
        assert_eq!(request.params.unwrap()["userId"], "u1");
    }

    #[test]
    fn test_string_and_null_ids() {
        let raw = r#"{"jsonrpc":"2.0","method":"health.check","id":"abc"}"#;
        let request: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(request.id, RequestId::String("abc".into()));
    }

    #[test]
    fn test_success_response_shape() {
        let response = Response::success(1.into(), json!({"ok": true}));
        let encoded = serde_json::to_string(&response).unwrap();
        assert!(encoded.contains("\"result\""));
        assert!(!encoded.contains("\"error\""));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(RpcError::MethodNotFound("x".into()).into_object().code, -32601);
        assert_eq!(RpcError::InvalidParams("x".into()).into_object().code, -32602);
        assert_eq!(RpcError::App("no such user".into()).into_object().code, -32000);
    }
}
