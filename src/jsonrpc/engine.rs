use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::codec::{FrameWriter, LineReader};
use super::handler::HandlerTable;
use super::message::{
    JsonRpcError, JsonRpcNotification, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse,
};

/// Errors surfaced to callers of [`JsonRpcEngine::call`] and [`JsonRpcEngine::notify`].
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("remote error {0}")]
    Remote(JsonRpcError),

    #[error("call to '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("params for '{method}' must be an array or an object")]
    UnstructuredParams { method: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("engine disposed")]
    Disposed,
}

impl RpcError {
    /// JSON-RPC code of a remote error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            RpcError::Remote(error) => Some(error.code),
            _ => None,
        }
    }

    /// `true` when the peer answered -32601. For optional capabilities this
    /// means "not implemented" rather than failure.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, RpcError::Remote(error) if error.is_method_not_found())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// The connection is gone (EOF, broken pipe or disposal).
    pub fn is_disconnect(&self) -> bool {
        match self {
            RpcError::ConnectionClosed | RpcError::Disposed => true,
            RpcError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Counters describing the health of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Lines dropped because they were not valid JSON-RPC.
    pub protocol_errors: u64,
    /// Responses whose id matched no pending call (late or bogus).
    pub unmatched_responses: u64,
    /// Calls currently waiting for a response.
    pub pending_calls: usize,
    /// Inbound requests/notifications still being handled.
    pub active_handlers: usize,
}

type PendingTable = HashMap<u64, oneshot::Sender<JsonRpcResponse>>;

struct Shared {
    writer: FrameWriter,
    handlers: RwLock<HandlerTable>,
    pending: Mutex<PendingTable>,
    next_id: AtomicU64,
    /// Fires once the receive loop has ended.
    closed: CancellationToken,
    disposed: AtomicBool,
    tracker: TaskTracker,
    protocol_errors: AtomicU64,
    unmatched_responses: AtomicU64,
}

/// Bidirectional JSON-RPC 2.0 endpoint over one byte-stream pair.
///
/// Construction spawns the receive loop, so it must happen inside a tokio
/// runtime. Both sides of a connection use the same type: each can call,
/// notify and serve handlers at the same time.
pub struct JsonRpcEngine {
    shared: Arc<Shared>,
    stop_reading: CancellationToken,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap handle for sending notifications, e.g. from inside a handler.
///
/// Holds a weak reference so handlers stored in the engine's table do not
/// keep the engine alive.
#[derive(Clone)]
pub struct JsonRpcNotifier {
    shared: Weak<Shared>,
}

/// Removes a pending entry however the call ends (response, timeout, write
/// failure or the caller dropping the future).
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.remove_pending(self.id);
    }
}

impl JsonRpcEngine {
    pub fn new<R, W>(reader: R, writer: W, handlers: HandlerTable) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            writer: FrameWriter::new(writer),
            handlers: RwLock::new(handlers),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            protocol_errors: AtomicU64::new(0),
            unmatched_responses: AtomicU64::new(0),
        });
        let stop_reading = CancellationToken::new();

        let receive_task = tokio::spawn(receive_loop(
            shared.clone(),
            LineReader::new(BufReader::new(reader)),
            stop_reading.clone(),
        ));

        Self {
            shared,
            stop_reading,
            receive_task: Mutex::new(Some(receive_task)),
        }
    }

    /// Serve over this process's own stdin/stdout.
    pub fn stdio(handlers: HandlerTable) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), handlers)
    }

    /// Send a request and wait for its response.
    ///
    /// On timeout the pending entry is removed; a response arriving later is
    /// dropped and counted in [`EngineStats::unmatched_responses`].
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.shared.ensure_open()?;
        check_params(method, params.as_ref())?;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (response_tx, response_rx) = oneshot::channel();
        self.shared.pending_table().insert(id, response_tx);
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        // 登録後に再確認（受信ループ終了との競合対策）
        self.shared.ensure_open()?;

        log::debug!("Sending request: {} (id: {})", method, id);
        let request = JsonRpcPayload::Request(JsonRpcRequest {
            id,
            method: method.to_string(),
            params,
        });

        let exchange = async {
            self.shared.writer.write(&request).await?;
            response_rx.await.map_err(|_| RpcError::ConnectionClosed)
        };

        let response = match tokio::time::timeout(timeout, exchange).await {
            Ok(response) => response?,
            Err(_) => {
                log::warn!(
                    "Request '{}' (id: {}) timed out after {:?}",
                    method,
                    id,
                    timeout
                );
                return Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                });
            }
        };

        match response.error {
            Some(error) => Err(RpcError::Remote(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// [`call`](Self::call) with typed params and result.
    pub async fn call_typed<P, R>(
        &self,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = match serde_json::to_value(params)? {
            Value::Null => None,
            params => Some(params),
        };
        let result = self.call(method, params, timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a notification. Returns as soon as the line is written.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.shared.notify(method, params).await
    }

    pub fn notifier(&self) -> JsonRpcNotifier {
        JsonRpcNotifier {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Mutate the handler table. Takes effect for the next inbound message.
    pub fn with_handlers<T>(&self, f: impl FnOnce(&mut HandlerTable) -> T) -> T {
        let mut handlers = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut handlers)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            protocol_errors: self.shared.protocol_errors.load(Ordering::Relaxed),
            unmatched_responses: self.shared.unmatched_responses.load(Ordering::Relaxed),
            pending_calls: self.shared.pending_table().len(),
            active_handlers: self.shared.tracker.len(),
        }
    }

    /// `true` once the inbound stream has ended or the engine was disposed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves when the receive loop has ended.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Stop reading, wait up to `grace` for in-flight handlers, then close
    /// the outbound stream. Idempotent.
    pub async fn dispose(&self, grace: Duration) -> Result<(), RpcError> {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("Disposing JSON-RPC engine");

        self.stop_reading.cancel();
        let receive_task = self
            .receive_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = receive_task {
            if let Err(e) = task.await {
                log::error!("Receive loop join error: {}", e);
            }
        }

        // 処理中のハンドラーを待つ（最後の進捗通知などを失わないため）
        self.shared.tracker.close();
        if tokio::time::timeout(grace, self.shared.tracker.wait())
            .await
            .is_err()
        {
            log::warn!(
                "{} handler task(s) still running after {:?}; closing anyway",
                self.shared.tracker.len(),
                grace
            );
        }

        self.shared.writer.close().await?;
        Ok(())
    }
}

impl Drop for JsonRpcEngine {
    fn drop(&mut self) {
        self.stop_reading.cancel();
    }
}

impl JsonRpcNotifier {
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        match self.shared.upgrade() {
            Some(shared) => shared.notify(method, params).await,
            None => Err(RpcError::Disposed),
        }
    }

    /// Serialize `params` and send them as a notification.
    pub async fn notify_typed<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), RpcError> {
        let params = match serde_json::to_value(params)? {
            Value::Null => None,
            params => Some(params),
        };
        self.notify(method, params).await
    }
}

/// JSON-RPC 2.0 では params は配列かオブジェクトのみ
fn check_params(method: &str, params: Option<&Value>) -> Result<(), RpcError> {
    match params {
        None | Some(Value::Array(_)) | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(RpcError::UnstructuredParams {
            method: method.to_string(),
        }),
    }
}

impl Shared {
    fn pending_table(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove_pending(&self, id: u64) {
        self.pending_table().remove(&id);
    }

    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(RpcError::Disposed)
        } else if self.closed.is_cancelled() {
            Err(RpcError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.ensure_open()?;
        check_params(method, params.as_ref())?;
        log::debug!("Sending notification: {}", method);
        let notification = JsonRpcPayload::Notification(JsonRpcNotification {
            method: method.to_string(),
            params,
        });
        self.writer.write(&notification).await?;
        Ok(())
    }

    fn resolve(&self, response: JsonRpcResponse) {
        let id = response.id;
        let sender = self.pending_table().remove(&id);
        let delivered = match sender {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        };
        if !delivered {
            self.unmatched_responses.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Dropping response for id {}: no pending call (timed out or unknown)",
                id
            );
        }
    }

    fn lookup(&self, method: &str) -> Option<super::handler::ErasedHandler> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(method)
    }

    async fn invoke(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let handler = self
            .lookup(method)
            .ok_or_else(|| JsonRpcError::method_not_found(method))?;

        // パニックしてもレスポンスは必ず返す
        match tokio::spawn(handler(params)).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Handler for '{}' failed: {}", method, e);
                Err(JsonRpcError::internal_error(Some(format!(
                    "handler for '{}' panicked",
                    method
                ))))
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) {
        log::debug!("Handling request: {} (id: {})", request.method, request.id);
        let response = match self.invoke(&request.method, request.params).await {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(error) => {
                if !error.is_method_not_found() {
                    log::debug!("Request '{}' failed: {}", request.method, error);
                }
                JsonRpcResponse::failure(request.id, error)
            }
        };

        if let Err(e) = self.writer.write(&JsonRpcPayload::Response(response)).await {
            log::warn!(
                "Failed to write response for '{}' (id: {}): {}",
                request.method,
                request.id,
                e
            );
        }
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) {
        match self.invoke(&notification.method, notification.params).await {
            Ok(_) => {}
            Err(error) if error.is_method_not_found() => {
                log::debug!(
                    "Ignoring notification for unknown method '{}'",
                    notification.method
                );
            }
            Err(error) => {
                log::warn!(
                    "Notification handler '{}' failed: {}",
                    notification.method,
                    error
                );
            }
        }
    }
}

async fn receive_loop<R>(shared: Arc<Shared>, mut reader: LineReader<R>, stop: CancellationToken)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    log::debug!("Receive loop started");

    loop {
        let item = tokio::select! {
            _ = stop.cancelled() => {
                log::debug!("Receive loop stopped");
                break;
            }
            item = reader.next_payload() => item,
        };

        match item {
            None => {
                log::debug!("EOF reached after {} line(s)", reader.lines_read());
                break;
            }
            Some(Err(e)) if e.is_fatal() => {
                log::warn!("Inbound stream failed: {}", e);
                break;
            }
            Some(Err(e)) => {
                shared.protocol_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping malformed message (code {}): {}", e.code(), e);
            }
            Some(Ok(JsonRpcPayload::Response(response))) => shared.resolve(response),
            Some(Ok(JsonRpcPayload::Request(request))) => {
                let shared_clone = shared.clone();
                shared
                    .tracker
                    .spawn(async move { shared_clone.handle_request(request).await });
            }
            Some(Ok(JsonRpcPayload::Notification(notification))) => {
                let shared_clone = shared.clone();
                shared
                    .tracker
                    .spawn(async move { shared_clone.handle_notification(notification).await });
            }
        }
    }

    // 先にclosedを立ててから保留中の呼び出しを解放する
    shared.closed.cancel();
    let abandoned = std::mem::take(&mut *shared.pending_table());
    if !abandoned.is_empty() {
        log::debug!("Failing {} pending call(s): connection closed", abandoned.len());
    }
}
