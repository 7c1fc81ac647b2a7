//! JSON-RPC 2.0 over a single stream pair
//!
//! このモジュールは、子プロセスの stdin/stdout を介した双方向の
//! JSON-RPC 2.0 通信を提供します。ホスト側と子プロセス側は同じ実装を使います。
//!
//! ## 主要コンポーネント
//!
//! - [`message`]: エンベロープ型とエラーコード
//! - [`codec`]: 改行区切りのフレーミング（読み取り・書き込み）
//! - [`handler`]: 型付きハンドラーの登録と変換
//! - [`engine`]: JsonRpcEngine - 呼び出し・通知・応答の対応付け・受信ループ
//!
//! ## 使用例
//!
//! ```rust,no_run
//! use denobridge::jsonrpc::{HandlerTable, JsonRpcEngine};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), denobridge::jsonrpc::RpcError> {
//! let mut handlers = HandlerTable::new();
//! handlers.register_value("ping", |_: serde_json::Value| async { "pong" });
//!
//! // 自プロセスのstdioで待ち受け
//! let engine = JsonRpcEngine::stdio(handlers);
//! let health = engine.call("health", None, Duration::from_secs(1)).await?;
//! # let _ = health;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod engine;
pub mod handler;
pub mod message;

pub use codec::{FrameWriter, LineReader, ProtocolError};
pub use engine::{EngineStats, JsonRpcEngine, JsonRpcNotifier, RpcError};
pub use handler::{ErasedHandler, HandlerFuture, HandlerTable};
pub use message::{
    ErrorCode, JsonRpcError, JsonRpcNotification, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse,
};
