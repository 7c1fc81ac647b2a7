//! 改行区切り JSON-RPC 2.0 のフレーミング
//!
//! One envelope per line: the encoder writes a single JSON value followed by
//! `\n`, the decoder yields one [`JsonRpcPayload`] (or a recoverable
//! [`ProtocolError`]) per non-empty line.

use std::io;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::message::{
    ErrorCode, JsonRpcError, JsonRpcNotification, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse,
};

/// Errors produced while decoding the inbound byte stream.
///
/// Everything except [`ProtocolError::Io`] is local to one line: the reader
/// logs it and moves on to the next line.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("line {line}: invalid JSON: {source}")]
    Malformed {
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: not valid UTF-8")]
    Utf8 { line: u64 },

    #[error("line {line}: invalid JSON-RPC envelope: {reason}")]
    InvalidEnvelope { line: u64, reason: String },

    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// JSON-RPC code describing this failure.
    pub fn code(&self) -> i32 {
        match self {
            ProtocolError::Malformed { .. } | ProtocolError::Utf8 { .. } => {
                ErrorCode::ParseError.code()
            }
            ProtocolError::InvalidEnvelope { .. } => ErrorCode::InvalidRequest.code(),
            ProtocolError::Io(_) => ErrorCode::InternalError.code(),
        }
    }

    /// Whether the stream itself is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }
}

/// Lazy per-connection sequence of decoded lines.
pub struct LineReader<R> {
    reader: R,
    buffer: Vec<u8>,
    line: u64,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(4096),
            line: 0,
        }
    }

    /// Number of lines consumed so far, blank lines included.
    pub fn lines_read(&self) -> u64 {
        self.line
    }

    /// Read the next envelope. `None` means EOF.
    pub async fn next_payload(&mut self) -> Option<Result<JsonRpcPayload, ProtocolError>> {
        loop {
            self.buffer.clear();
            match self.reader.read_until(b'\n', &mut self.buffer).await {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(ProtocolError::Io(e))),
            }
            self.line += 1;

            let text = match std::str::from_utf8(&self.buffer) {
                Ok(text) => text.trim(),
                Err(_) => return Some(Err(ProtocolError::Utf8 { line: self.line })),
            };
            if text.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(text) {
                Ok(value) => value,
                Err(source) => {
                    return Some(Err(ProtocolError::Malformed {
                        line: self.line,
                        source,
                    }))
                }
            };

            return Some(parse_payload(value).map_err(|reason| ProtocolError::InvalidEnvelope {
                line: self.line,
                reason,
            }));
        }
    }
}

/// Classify a decoded JSON value as request, notification or response.
pub fn parse_payload(json: Value) -> Result<JsonRpcPayload, String> {
    let mut obj = match json {
        Value::Object(obj) => obj,
        _ => return Err("JSON-RPC message must be an object".to_string()),
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some("2.0") => {}
        Some(other) => return Err(format!("unsupported jsonrpc version '{}'", other)),
        None => return Err("missing jsonrpc version".to_string()),
    }

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(id) => Some(
            id.as_u64()
                .ok_or_else(|| format!("id must be a non-negative integer, got {}", id))?,
        ),
    };

    // methodがあればリクエストか通知
    if let Some(method) = obj.remove("method") {
        let method = match method {
            Value::String(method) => method,
            _ => return Err("method must be a string".to_string()),
        };
        let params = match obj.remove("params") {
            None => None,
            Some(params @ (Value::Array(_) | Value::Object(_))) => Some(params),
            Some(other) => return Err(format!("params must be an array or object, got {}", other)),
        };
        return Ok(match id {
            Some(id) => JsonRpcPayload::Request(JsonRpcRequest { id, method, params }),
            None => JsonRpcPayload::Notification(JsonRpcNotification { method, params }),
        });
    }

    // idとresult/errorがあればレスポンス
    let id = id.ok_or_else(|| "message has neither method nor id".to_string())?;
    if let Some(error) = obj.remove("error") {
        let error = parse_error_object(error)?;
        return Ok(JsonRpcPayload::Response(JsonRpcResponse::failure(id, error)));
    }
    if let Some(result) = obj.remove("result") {
        return Ok(JsonRpcPayload::Response(JsonRpcResponse::success(id, result)));
    }

    Err(format!("response {} carries neither result nor error", id))
}

fn parse_error_object(error: Value) -> Result<JsonRpcError, String> {
    let mut obj = match error {
        Value::Object(obj) => obj,
        _ => return Err("error must be an object".to_string()),
    };
    let code = obj
        .get("code")
        .and_then(Value::as_i64)
        .and_then(|code| i32::try_from(code).ok())
        .ok_or_else(|| "error.code must be an integer".to_string())?;
    let message = match obj.remove("message") {
        Some(Value::String(message)) => message,
        _ => return Err("error.message must be a string".to_string()),
    };
    Ok(JsonRpcError {
        code,
        message,
        data: obj.remove("data"),
    })
}

/// Convert a payload into its JSON-RPC 2.0 wire object.
pub fn payload_to_json(payload: &JsonRpcPayload) -> Value {
    let mut obj = Map::new();
    obj.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));

    match payload {
        JsonRpcPayload::Request(req) => {
            obj.insert("id".to_string(), Value::Number(req.id.into()));
            obj.insert("method".to_string(), Value::String(req.method.clone()));
            if let Some(params) = &req.params {
                obj.insert("params".to_string(), params.clone());
            }
        }
        JsonRpcPayload::Notification(notif) => {
            obj.insert("method".to_string(), Value::String(notif.method.clone()));
            if let Some(params) = &notif.params {
                obj.insert("params".to_string(), params.clone());
            }
        }
        JsonRpcPayload::Response(resp) => {
            obj.insert("id".to_string(), Value::Number(resp.id.into()));
            match &resp.error {
                Some(error) => {
                    obj.insert("error".to_string(), error.to_json());
                }
                None => {
                    obj.insert(
                        "result".to_string(),
                        resp.result.clone().unwrap_or(Value::Null),
                    );
                }
            }
        }
    }

    Value::Object(obj)
}

/// Serialize one payload as a single `\n`-terminated line.
pub fn encode_line(payload: &JsonRpcPayload) -> io::Result<String> {
    let mut line = serde_json::to_string(&payload_to_json(payload)).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON serialization error: {}", e),
        )
    })?;
    line.push('\n');
    Ok(line)
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The single serialization point for outbound lines.
///
/// Every write holds the lock for the whole line plus flush, so concurrent
/// senders never interleave partial lines.
pub struct FrameWriter {
    inner: Mutex<Option<BoxedWriter>>,
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Mutex::new(Some(Box::new(writer))),
        }
    }

    pub async fn write(&self, payload: &JsonRpcPayload) -> io::Result<()> {
        let line = encode_line(payload)?;
        let mut guard = self.inner.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "writer closed"))?;

        log::trace!("-> {}", line.trim_end());
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    /// Shut the stream down. Later writes fail with `NotConnected`.
    pub async fn close(&self) -> io::Result<()> {
        let writer = self.inner.lock().await.take();
        match writer {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, BufReader};

    async fn decode_all(input: &'static [u8]) -> Vec<Result<JsonRpcPayload, ProtocolError>> {
        let mut reader = LineReader::new(BufReader::new(input));
        let mut out = Vec::new();
        while let Some(item) = reader.next_payload().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_decode_request_notification_response() {
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"read\",\"params\":{\"value\":\"x\"}}\n\
{\"jsonrpc\":\"2.0\",\"method\":\"invokeProgress\",\"params\":[1]}\n\
{\"jsonrpc\":\"2.0\",\"id\":7,\"result\":null}\n";

        let items = decode_all(input).await;
        assert_eq!(items.len(), 3);
        match &items[0] {
            Ok(JsonRpcPayload::Request(req)) => {
                assert_eq!(req.id, 1);
                assert_eq!(req.method, "read");
                assert_eq!(req.params, Some(json!({"value": "x"})));
            }
            other => panic!("Expected Request payload, got {:?}", other),
        }
        match &items[1] {
            Ok(JsonRpcPayload::Notification(notif)) => {
                assert_eq!(notif.method, "invokeProgress");
            }
            other => panic!("Expected Notification payload, got {:?}", other),
        }
        match &items[2] {
            Ok(JsonRpcPayload::Response(resp)) => {
                assert_eq!(resp.id, 7);
                assert_eq!(resp.result, Some(Value::Null));
                assert!(resp.error.is_none());
            }
            other => panic!("Expected Response payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_stop_reader() {
        let input = b"{not json\n\n{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n";

        let items = decode_all(input).await;
        assert_eq!(items.len(), 2);
        match &items[0] {
            Err(err) => {
                assert_eq!(err.code(), -32700);
                assert!(!err.is_fatal());
            }
            Ok(payload) => panic!("Expected parse error, got {:?}", payload),
        }
        assert!(matches!(items[1], Ok(JsonRpcPayload::Notification(_))));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_a_parse_error() {
        let input: &'static [u8] = b"\xff\xfe\n{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n";
        let items = decode_all(input).await;
        assert!(matches!(items[0], Err(ProtocolError::Utf8 { line: 1 })));
        assert!(items[1].is_ok());
    }

    #[test]
    fn test_parse_error_response() {
        let payload = parse_payload(json!({
            "jsonrpc": "2.0",
            "id": 42,
            "error": {"code": -32601, "message": "Method not found", "data": "create"}
        }))
        .unwrap();
        match payload {
            JsonRpcPayload::Response(resp) => {
                let error = resp.error.unwrap();
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "Method not found");
                assert_eq!(error.data, Some(json!("create")));
            }
            other => panic!("Expected Response payload, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_envelopes() {
        assert!(parse_payload(json!([1, 2])).is_err());
        assert!(parse_payload(json!({"id": 1, "method": "x"})).is_err());
        assert!(parse_payload(json!({"jsonrpc": "1.0", "method": "x"})).is_err());
        assert!(parse_payload(json!({"jsonrpc": "2.0", "id": "abc", "method": "x"})).is_err());
        assert!(parse_payload(json!({"jsonrpc": "2.0", "id": 3})).is_err());
        assert!(parse_payload(json!({"jsonrpc": "2.0", "id": null, "result": 1})).is_err());
        // params はスカラー不可
        assert!(parse_payload(json!({"jsonrpc": "2.0", "id": 4, "method": "x", "params": 250})).is_err());
        assert!(parse_payload(json!({"jsonrpc": "2.0", "method": "x", "params": null})).is_err());
        assert!(parse_payload(json!({"jsonrpc": "2.0", "method": "x", "params": []})).is_ok());
    }

    #[test]
    fn test_encode_line_shapes() {
        let request = JsonRpcPayload::Request(JsonRpcRequest {
            id: 1,
            method: "health".to_string(),
            params: None,
        });
        assert_eq!(
            encode_line(&request).unwrap(),
            "{\"id\":1,\"jsonrpc\":\"2.0\",\"method\":\"health\"}\n"
        );

        let notification = JsonRpcPayload::Notification(JsonRpcNotification {
            method: "shutdown".to_string(),
            params: None,
        });
        let json = payload_to_json(&notification);
        assert!(json.get("id").is_none()); // 通知にはidがない

        let failure = JsonRpcPayload::Response(JsonRpcResponse::failure(
            9,
            JsonRpcError::method_not_found("create"),
        ));
        let json = payload_to_json(&failure);
        assert_eq!(json["error"]["code"], -32601);
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_encoded_line_has_single_newline() {
        let payload = JsonRpcPayload::Notification(JsonRpcNotification {
            method: "log".to_string(),
            params: Some(json!({"text": "line one\nline two"})),
        });
        let line = encode_line(&payload).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_frame_writer_close_rejects_writes() {
        let (client, mut server) = tokio::io::duplex(1024);
        let writer = FrameWriter::new(client);
        let payload = JsonRpcPayload::Notification(JsonRpcNotification {
            method: "ping".to_string(),
            params: None,
        });

        writer.write(&payload).await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.is_closed().await);

        let err = writer.write(&payload).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let mut received = String::new();
        server.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n");
    }
}
