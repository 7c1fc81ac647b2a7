// ChildRuntime の統合テスト
// 実際の子プロセス（denobridge-echo-child）を起動してライフサイクル全体を確認

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use denobridge::error::{ProcessError, RuntimeError};
use denobridge::jsonrpc::HandlerTable;
use denobridge::subprocess::{
    BootstrapProfile, ChildRuntime, FixedRuntime, RuntimeConfigFile, RuntimeState,
};
use denobridge::RuntimeOptions;
use serde_json::{json, Value};
use tempfile::TempDir;

const ECHO_CHILD: &str = env!("CARGO_BIN_EXE_denobridge-echo-child");

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Fixture {
    dir: TempDir,
    script: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("main.ts");
        std::fs::write(&script, "export default { read: (p: unknown) => p };\n").unwrap();
        Self { dir, script }
    }

    fn bootstrap_dir(&self) -> PathBuf {
        self.dir.path().join("bootstrap")
    }

    fn options(&self, mode: &str) -> RuntimeOptions {
        RuntimeOptions::default()
            .with_env("DENOBRIDGE_ECHO_MODE", mode)
            .with_bootstrap_dir(self.bootstrap_dir())
            .with_call_timeout(Duration::from_secs(5))
            .with_kill_timeout(Duration::from_secs(2))
    }

    async fn start(
        &self,
        options: RuntimeOptions,
        handlers: HandlerTable,
    ) -> Result<ChildRuntime, RuntimeError> {
        ChildRuntime::builder(BootstrapProfile::DataSource, &self.script)
            .runtime_config(RuntimeConfigFile::Disabled)
            .resolver(Arc::new(FixedRuntime(PathBuf::from(ECHO_CHILD))))
            .options(options)
            .handlers(handlers)
            .start()
            .await
    }

    fn leftover_bootstraps(&self) -> usize {
        count_files(&self.bootstrap_dir())
    }
}

fn count_files(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn test_end_to_end_read_missing_method_and_stop() {
    init_logger();
    let fixture = Fixture::new();
    let runtime = fixture
        .start(fixture.options("normal"), HandlerTable::new())
        .await
        .unwrap();

    assert_eq!(runtime.state(), RuntimeState::Running);
    assert!(runtime.bootstrap_path().exists());
    assert!(runtime.pid().is_some());

    let result = runtime
        .call("read", Some(json!({"value": "x"})))
        .await
        .unwrap();
    assert_eq!(result, json!({"value": "x"}));

    let err = runtime.call("create", None).await.unwrap_err();
    assert!(err.is_method_not_found());
    assert_eq!(err.code(), Some(-32601));

    // 省略可能なメソッドとして呼べば未実装は None
    assert_eq!(runtime.call_optional("modifyPlan", None).await.unwrap(), None);

    let err = runtime
        .call("fail", Some(json!({"message": "bad input"})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(-32000));

    assert_eq!(runtime.stats().pending_calls, 0);

    runtime.stop().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Stopped);
    assert!(runtime.has_exited());
    assert_eq!(fixture.leftover_bootstraps(), 0);
}

#[tokio::test]
async fn test_child_progress_notifications_reach_host_handlers() {
    let fixture = Fixture::new();
    let progress = Arc::new(Mutex::new(Vec::new()));

    let mut handlers = HandlerTable::new();
    let sink = progress.clone();
    handlers.register_sink("invokeProgress", move |params: Value| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(params);
        }
    });

    let runtime = fixture
        .start(fixture.options("normal"), handlers)
        .await
        .unwrap();
    let result: Value = runtime.call_typed("invoke", &json!({"steps": 3})).await.unwrap();
    assert_eq!(result, json!({"steps": 3}));

    // 停止時に処理中の通知ハンドラーを待つ
    runtime.stop().await.unwrap();
    let progress = progress.lock().unwrap();
    assert_eq!(progress.len(), 3);
    assert_eq!(progress[0], json!({"step": 0, "of": 3}));
}

#[tokio::test]
async fn test_stop_drains_inflight_calls() {
    let fixture = Fixture::new();
    let runtime = Arc::new(
        fixture
            .start(fixture.options("normal"), HandlerTable::new())
            .await
            .unwrap(),
    );

    let inflight = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.call("sleep", Some(json!({"ms": 300}))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    runtime.stop().await.unwrap();
    assert_eq!(inflight.await.unwrap().unwrap(), json!(300));

    // 停止後の呼び出しは状態エラー
    let err = runtime.call("read", None).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Process(ProcessError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_readiness_timeout_when_health_never_answers() {
    init_logger();
    let fixture = Fixture::new();
    let options = fixture
        .options("hang")
        .with_readiness_timeout(Duration::from_millis(400))
        .with_kill_timeout(Duration::from_millis(100));

    let started = Instant::now();
    let err = fixture.start(options, HandlerTable::new()).await.unwrap_err();

    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(matches!(
        err,
        RuntimeError::Process(ProcessError::ReadinessTimeout { .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(fixture.leftover_bootstraps(), 0);
}

#[tokio::test]
async fn test_crash_during_start_fails_fast() {
    let fixture = Fixture::new();
    let options = fixture
        .options("crash-on-start")
        .with_readiness_timeout(Duration::from_secs(30));

    let started = Instant::now();
    let err = fixture.start(options, HandlerTable::new()).await.unwrap_err();

    match err {
        RuntimeError::Process(ProcessError::Exited { status }) => {
            assert_eq!(status.and_then(|s| s.code()), Some(3));
        }
        other => panic!("unexpected error: {other}"),
    }
    // 30秒のタイムアウトを待たずに失敗する
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(fixture.leftover_bootstraps(), 0);
}

#[tokio::test]
async fn test_unbounded_readiness_timeout_does_not_overflow() {
    let fixture = Fixture::new();
    let options = fixture
        .options("crash-on-start")
        .with_readiness_timeout(Duration::MAX);

    let err = fixture.start(options, HandlerTable::new()).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Process(ProcessError::Exited { .. })
    ));
}

#[tokio::test]
async fn test_crash_while_running_surfaces_on_call() {
    let fixture = Fixture::new();
    let runtime = fixture
        .start(fixture.options("crash-on-read"), HandlerTable::new())
        .await
        .unwrap();

    let err = runtime.call("read", Some(json!({}))).await.unwrap_err();
    match err {
        RuntimeError::Process(ProcessError::Exited { status }) => {
            assert_eq!(status.and_then(|s| s.code()), Some(7));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runtime.state(), RuntimeState::Failed);

    // 以降の呼び出しも終了ステータス付きで失敗し、ハングしない
    for method in ["read", "health"] {
        match runtime.call(method, None).await.unwrap_err() {
            RuntimeError::Process(ProcessError::Exited { status }) => {
                assert_eq!(status.and_then(|s| s.code()), Some(7));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
    assert!(matches!(
        runtime.notify("log", Some(json!({"text": "late"}))).await,
        Err(RuntimeError::Process(ProcessError::Exited { .. }))
    ));

    runtime.stop().await.unwrap();
    runtime.stop().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Failed);
    assert_eq!(fixture.leftover_bootstraps(), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent_after_voluntary_exit() {
    let fixture = Fixture::new();
    let runtime = fixture
        .start(fixture.options("normal"), HandlerTable::new())
        .await
        .unwrap();

    // shutdown 通知で子プロセスが自ら終了する
    runtime.notify("shutdown", None).await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), runtime.wait_exit())
        .await
        .unwrap();
    assert!(status.map(|s| s.success()).unwrap_or(false));

    runtime.stop().await.unwrap();
    runtime.stop().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Stopped);
}

#[tokio::test]
async fn test_stop_kills_child_that_ignores_shutdown() {
    let fixture = Fixture::new();
    let options = fixture
        .options("ignore-shutdown")
        .with_kill_timeout(Duration::from_millis(200))
        .with_dispose_grace(Duration::from_millis(200));
    let runtime = fixture.start(options, HandlerTable::new()).await.unwrap();

    let started = Instant::now();
    runtime.stop().await.unwrap();
    assert!(runtime.has_exited());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_concurrent_stops_do_not_double_kill() {
    let fixture = Fixture::new();
    let runtime = Arc::new(
        fixture
            .start(fixture.options("normal"), HandlerTable::new())
            .await
            .unwrap(),
    );

    let stops: Vec<_> = (0..3)
        .map(|_| {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.stop().await })
        })
        .collect();
    for stop in stops {
        stop.await.unwrap().unwrap();
    }
    assert_eq!(runtime.state(), RuntimeState::Stopped);
}
