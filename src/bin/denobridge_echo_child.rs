//! Reference child speaking the bridge protocol over its own stdio.
//!
//! Mirrors what the generated glue does for a data-source script whose
//! `read` echoes its params, plus an `invoke` that reports progress. Launch
//! arguments are ignored so it can stand in for the runtime binary.
//!
//! `DENOBRIDGE_ECHO_MODE` selects misbehaviour for tests:
//! - `normal` (default)
//! - `hang`: never answers `health`
//! - `crash-on-start`: exits with status 3 before serving
//! - `crash-on-read`: exits with status 7 when `read` is called
//! - `ignore-shutdown`: keeps running after the `shutdown` notification

use std::time::Duration;

use denobridge::jsonrpc::{HandlerTable, JsonRpcEngine, JsonRpcError};
use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const MODE_ENV: &str = "DENOBRIDGE_ECHO_MODE";
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct FailParams {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    ms: u64,
}

#[derive(Debug, Deserialize)]
struct InvokeParams {
    steps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EchoMode {
    Normal,
    Hang,
    CrashOnStart,
    CrashOnRead,
    IgnoreShutdown,
}

impl EchoMode {
    fn from_env() -> anyhow::Result<Self> {
        let raw = std::env::var(MODE_ENV).unwrap_or_default();
        match raw.as_str() {
            "" | "normal" => Ok(EchoMode::Normal),
            "hang" => Ok(EchoMode::Hang),
            "crash-on-start" => Ok(EchoMode::CrashOnStart),
            "crash-on-read" => Ok(EchoMode::CrashOnRead),
            "ignore-shutdown" => Ok(EchoMode::IgnoreShutdown),
            other => anyhow::bail!("unknown {} '{}'", MODE_ENV, other),
        }
    }
}

fn build_handlers(mode: EchoMode, shutdown: CancellationToken) -> HandlerTable {
    let mut handlers = HandlerTable::new();

    handlers.register_nullary("health", move || async move {
        if mode == EchoMode::Hang {
            std::future::pending::<()>().await;
        }
        Ok::<_, JsonRpcError>(json!({"ok": true}))
    });

    handlers.register_value("read", move |params: Value| async move {
        if mode == EchoMode::CrashOnRead {
            eprintln!("echo child: crashing on read");
            std::process::exit(7);
        }
        params
    });

    handlers.register("fail", |params: FailParams| async move {
        Err::<Value, _>(JsonRpcError::handler_error(params.message))
    });

    handlers.register_value("sleep", |SleepParams { ms }| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        ms
    });

    handlers.register_sink("shutdown", move |_: Value| {
        let shutdown = shutdown.clone();
        async move {
            if mode == EchoMode::IgnoreShutdown {
                debug!("ignoring shutdown");
                return;
            }
            shutdown.cancel();
        }
    });

    handlers
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mode = EchoMode::from_env()?;
    debug!("echo child starting in {:?} mode", mode);
    if mode == EchoMode::CrashOnStart {
        eprintln!("echo child: crashing on start");
        std::process::exit(3);
    }

    let shutdown = CancellationToken::new();
    let engine = JsonRpcEngine::stdio(build_handlers(mode, shutdown.clone()));

    // invoke は進捗通知を送ってから完了する
    let notifier = engine.notifier();
    engine.with_handlers(|table| {
        table.register("invoke", move |InvokeParams { steps }| {
            let notifier = notifier.clone();
            async move {
                for step in 0..steps {
                    notifier
                        .notify_typed("invokeProgress", &json!({"step": step, "of": steps}))
                        .await
                        .map_err(|e| JsonRpcError::handler_error(e.to_string()))?;
                }
                Ok::<_, JsonRpcError>(json!({"steps": steps}))
            }
        });
    });

    tokio::select! {
        _ = shutdown.cancelled() => info!("shutdown requested"),
        _ = engine.closed() => info!("host closed stdin"),
    }

    engine.dispose(DRAIN_GRACE).await?;
    debug!("echo child drained: {:?}", engine.stats());

    // stdin の読み取りスレッドがランタイム終了を妨げるので明示的に終了する
    std::process::exit(0);
}
