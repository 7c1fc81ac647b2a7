use serde_json::{Map, Value};

/// JSON-RPC 2.0 の予約済みエラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
    /// Start of the implementation-defined band (-32000..=-32099).
    ServerError = -32000,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::ServerError => "Server error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

/// A response envelope. Exactly one of `result` / `error` is set on the wire;
/// a success with no result is written as `"result": null`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcPayload {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: JsonRpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl JsonRpcError {
    pub fn new(code: ErrorCode, message: Option<String>, data: Option<Value>) -> Self {
        Self {
            code: code.code(),
            message: message.unwrap_or_else(|| code.message().to_string()),
            data,
        }
    }

    /// Error with an arbitrary (usually implementation-defined) code.
    pub fn custom(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: Option<String>) -> Self {
        Self::new(ErrorCode::ParseError, message, None)
    }

    pub fn invalid_request(message: Option<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, None)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            Some(format!("Method '{}' not found", method)),
            Some(Value::String(method.to_string())),
        )
    }

    pub fn invalid_params(message: Option<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, None)
    }

    pub fn internal_error(message: Option<String>) -> Self {
        Self::new(ErrorCode::InternalError, message, None)
    }

    /// Business-logic failure reported by a handler.
    pub fn handler_error(message: impl Into<String>) -> Self {
        Self::custom(ErrorCode::ServerError.code(), message)
    }

    pub fn is_method_not_found(&self) -> bool {
        self.code == ErrorCode::MethodNotFound.code()
    }

    pub(crate) fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("code".to_string(), Value::Number(self.code.into()));
        obj.insert("message".to_string(), Value::String(self.message.clone()));
        if let Some(data) = &self.data {
            obj.insert("data".to_string(), data.clone());
        }
        Value::Object(obj)
    }
}

impl From<anyhow::Error> for JsonRpcError {
    fn from(err: anyhow::Error) -> Self {
        // {:#} keeps the context chain on one line
        JsonRpcError::handler_error(format!("{:#}", err))
    }
}

impl From<String> for JsonRpcError {
    fn from(message: String) -> Self {
        JsonRpcError::handler_error(message)
    }
}

impl From<&str> for JsonRpcError {
    fn from(message: &str) -> Self {
        JsonRpcError::handler_error(message)
    }
}

impl JsonRpcPayload {
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcPayload::Request(req) => Some(&req.method),
            JsonRpcPayload::Notification(notif) => Some(&notif.method),
            JsonRpcPayload::Response(_) => None,
        }
    }
}
