use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::bootstrap::{self, BootstrapProfile, HEALTH_METHOD, SHUTDOWN_METHOD};
use super::launch::{ConfigFileCache, LaunchSpec, Permissions, RuntimeConfigFile};
use super::resolver::{PathRuntime, RuntimeResolver};
use crate::config::RuntimeOptions;
use crate::error::{ProcessError, RuntimeError};
use crate::jsonrpc::{EngineStats, HandlerTable, JsonRpcEngine, JsonRpcNotifier, RpcError};

/// How long a failed call waits for the exit watcher to report before the
/// failure is attributed to the connection rather than the process.
const EXIT_SETTLE: Duration = Duration::from_millis(500);
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Lifecycle of one child runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl RuntimeState {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeState::Created => "created",
            RuntimeState::Starting => "starting",
            RuntimeState::Ready => "ready",
            RuntimeState::Running => "running",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Stopped => "stopped",
            RuntimeState::Failed => "failed",
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the exit watcher has observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Running,
    /// `None` when the status could not be collected.
    Exited(Option<ExitStatus>),
}

impl ChildExit {
    pub fn is_exited(&self) -> bool {
        matches!(self, ChildExit::Exited(_))
    }
}

/// Collects the inputs of [`ChildRuntime`] startup.
pub struct RuntimeBuilder {
    profile: BootstrapProfile,
    script: PathBuf,
    runtime_config: RuntimeConfigFile,
    permissions: Permissions,
    options: RuntimeOptions,
    handlers: HandlerTable,
    resolver: Arc<dyn RuntimeResolver>,
    config_cache: Arc<ConfigFileCache>,
}

impl RuntimeBuilder {
    pub fn runtime_config(mut self, runtime_config: RuntimeConfigFile) -> Self {
        self.runtime_config = runtime_config;
        self
    }

    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Host-side handlers the child may call (e.g. `invokeProgress`).
    pub fn handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn RuntimeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config_cache(mut self, cache: Arc<ConfigFileCache>) -> Self {
        self.config_cache = cache;
        self
    }

    pub async fn start(self) -> Result<ChildRuntime, RuntimeError> {
        ChildRuntime::launch(self).await
    }
}

/// A running child runtime and the JSON-RPC connection to it.
///
/// Obtained from [`ChildRuntime::start`] or [`ChildRuntime::builder`]. The
/// child is ready (answered `health`) by the time the handle is returned.
/// [`stop`](Self::stop) must be called to release the process and the
/// bootstrap file; dropping the handle only kills the process.
pub struct ChildRuntime {
    profile: BootstrapProfile,
    script: PathBuf,
    bootstrap: PathBuf,
    pid: Option<u32>,
    options: RuntimeOptions,
    engine: JsonRpcEngine,
    state: Mutex<RuntimeState>,
    exit_rx: watch::Receiver<ChildExit>,
    kill: CancellationToken,
    watcher: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    stop_lock: tokio::sync::Mutex<bool>,
}

impl ChildRuntime {
    pub fn builder(profile: BootstrapProfile, script: impl Into<PathBuf>) -> RuntimeBuilder {
        RuntimeBuilder {
            profile,
            script: script.into(),
            runtime_config: RuntimeConfigFile::default(),
            permissions: Permissions::default(),
            options: RuntimeOptions::default(),
            handlers: HandlerTable::new(),
            resolver: Arc::new(PathRuntime::default()),
            config_cache: Arc::new(ConfigFileCache::new()),
        }
    }

    /// Start with default options, the `PATH` resolver and no host handlers.
    pub async fn start(
        profile: BootstrapProfile,
        script: impl Into<PathBuf>,
        runtime_config: RuntimeConfigFile,
        permissions: Permissions,
    ) -> Result<ChildRuntime, RuntimeError> {
        Self::builder(profile, script)
            .runtime_config(runtime_config)
            .permissions(permissions)
            .start()
            .await
    }

    async fn launch(builder: RuntimeBuilder) -> Result<ChildRuntime, RuntimeError> {
        let RuntimeBuilder {
            profile,
            script,
            runtime_config,
            permissions,
            options,
            handlers,
            resolver,
            config_cache,
        } = builder;
        log::debug!("Starting {} runtime for {}", profile, script.display());

        let script = tokio::fs::canonicalize(&script)
            .await
            .map_err(|source| ProcessError::Script {
                path: script.clone(),
                source,
            })?;
        let runtime = resolver.resolve().await?;

        let (config_file, no_config) = match runtime_config {
            RuntimeConfigFile::Discover => (config_cache.discover(&script), false),
            RuntimeConfigFile::Path(path) => (Some(path), false),
            RuntimeConfigFile::Disabled => (None, true),
        };

        let dir = options.bootstrap_dir();
        let bootstrap_file = bootstrap::materialize(&dir, profile, &script)
            .await
            .map_err(|source| ProcessError::Bootstrap {
                path: bootstrap::bootstrap_path(&dir, profile, &script),
                source,
            })?;

        let spec = LaunchSpec {
            runtime: runtime.clone(),
            bootstrap: bootstrap_file.clone(),
            permissions,
            config_file,
            no_config,
            extra_args: options.extra_args.clone(),
        };
        log::debug!("Launching {} {:?}", runtime.display(), spec.args());

        let mut command = spec.command();
        command
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                remove_bootstrap(&bootstrap_file).await.ok();
                return Err(ProcessError::Spawn { runtime, source }.into());
            }
        };
        let pid = child.id();

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            (stdin, stdout, _) => {
                let missing = if stdin.is_none() {
                    "stdin"
                } else if stdout.is_none() {
                    "stdout"
                } else {
                    "stderr"
                };
                child.start_kill().ok();
                remove_bootstrap(&bootstrap_file).await.ok();
                return Err(ProcessError::MissingPipe(missing).into());
            }
        };

        let engine = JsonRpcEngine::new(stdout, stdin, handlers);
        let stderr_task = tokio::spawn(forward_stderr(stderr, pid));

        let (exit_tx, exit_rx) = watch::channel(ChildExit::Running);
        let kill = CancellationToken::new();
        let watcher = tokio::spawn(watch_exit(child, kill.clone(), exit_tx, pid));

        let handle = ChildRuntime {
            profile,
            script,
            bootstrap: bootstrap_file,
            pid,
            options,
            engine,
            state: Mutex::new(RuntimeState::Starting),
            exit_rx,
            kill,
            watcher: Mutex::new(Some(watcher)),
            stderr_task: Mutex::new(Some(stderr_task)),
            stop_lock: tokio::sync::Mutex::new(false),
        };

        match handle.wait_ready().await {
            Ok(()) => {
                handle.set_state(RuntimeState::Ready);
                log::info!(
                    "{} runtime ready (pid {})",
                    handle.profile,
                    handle.pid_label()
                );
                handle.set_state(RuntimeState::Running);
                Ok(handle)
            }
            Err(e) => {
                log::warn!("{} runtime failed to start: {}", handle.profile, e);
                handle.set_state(RuntimeState::Failed);
                if let Err(teardown) = handle.stop().await {
                    log::warn!("Cleanup after failed start: {}", teardown);
                }
                Err(e.into())
            }
        }
    }

    /// Poll `health` until it succeeds, the child exits, or the readiness
    /// window closes.
    async fn wait_ready(&self) -> Result<(), ProcessError> {
        let timeout = self.options.readiness_timeout;
        let now = Instant::now();
        // 巨大な設定値でも溢れないようにする
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let mut exit_rx = self.exit_rx.clone();
        let mut last_error: Option<String> = None;
        let mut attempts = 0u32;

        loop {
            if let ChildExit::Exited(status) = *exit_rx.borrow() {
                return Err(ProcessError::Exited { status });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProcessError::ReadinessTimeout {
                    timeout,
                    last_error,
                });
            }

            attempts += 1;
            let attempt_timeout = self.options.health_call_timeout.min(remaining);
            tokio::select! {
                result = self.engine.call(HEALTH_METHOD, None, attempt_timeout) => match result {
                    Ok(_) => {
                        log::debug!("health answered after {} attempt(s)", attempts);
                        return Ok(());
                    }
                    Err(e) => {
                        log::debug!("health attempt {} failed: {}", attempts, e);
                        last_error = Some(e.to_string());
                    }
                },
                // 子プロセスが落ちたらタイムアウトを待たずに抜ける
                status = wait_exit(&mut exit_rx) => {
                    return Err(ProcessError::Exited { status });
                }
            }

            let pause = self
                .options
                .health_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                status = wait_exit(&mut exit_rx) => {
                    return Err(ProcessError::Exited { status });
                }
            }
        }
    }

    pub fn profile(&self) -> BootstrapProfile {
        self.profile
    }

    pub fn script_path(&self) -> &Path {
        &self.script
    }

    pub fn bootstrap_path(&self) -> &Path {
        &self.bootstrap
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn exit_state(&self) -> ChildExit {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_state().is_exited()
    }

    /// Resolves once the child process has exited.
    pub async fn wait_exit(&self) -> Option<ExitStatus> {
        let mut exit_rx = self.exit_rx.clone();
        wait_exit(&mut exit_rx).await
    }

    pub fn notifier(&self) -> JsonRpcNotifier {
        self.engine.notifier()
    }

    /// Register or replace host-side handlers while running.
    pub fn with_handlers<T>(&self, f: impl FnOnce(&mut HandlerTable) -> T) -> T {
        self.engine.with_handlers(f)
    }

    /// Call with the configured default timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RuntimeError> {
        self.call_with_timeout(method, params, self.options.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RuntimeError> {
        self.ensure_usable("call")?;
        match self.engine.call(method, params, timeout).await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.classify(e).await),
        }
    }

    pub async fn call_typed<P, R>(&self, method: &str, params: &P) -> Result<R, RuntimeError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.ensure_usable("call")?;
        match self
            .engine
            .call_typed(method, params, self.options.call_timeout)
            .await
        {
            Ok(value) => Ok(value),
            Err(e) => Err(self.classify(e).await),
        }
    }

    /// Call a method the child may not implement. `Ok(None)` means the
    /// child answered -32601.
    pub async fn call_optional(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Option<Value>, RuntimeError> {
        match self.call(method, params).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_method_not_found() => {
                log::debug!("{} does not implement optional '{}'", self.profile, method);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RuntimeError> {
        self.ensure_usable("notify")?;
        match self.engine.notify(method, params).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.classify(e).await),
        }
    }

    /// Shut the child down and delete the bootstrap file.
    ///
    /// Steps: `shutdown` notification, wait for a voluntary exit, dispose the
    /// connection, kill, delete the bootstrap file. Every step runs even if an
    /// earlier one failed; the first failure is returned and the rest are
    /// logged. Calling it again (or after the child already exited) is a no-op
    /// success.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let mut stopped = self.stop_lock.lock().await;
        if *stopped {
            return Ok(());
        }
        *stopped = true;

        let previous = self.set_state(RuntimeState::Stopping);
        log::debug!(
            "Stopping {} runtime (pid {}, was {})",
            self.profile,
            self.pid_label(),
            previous
        );
        let mut failures: Vec<RuntimeError> = Vec::new();

        if !self.has_exited() && !self.engine.is_closed() {
            match self.engine.notify(SHUTDOWN_METHOD, None).await {
                Ok(()) => {
                    let mut exit_rx = self.exit_rx.clone();
                    if tokio::time::timeout(self.options.kill_timeout, wait_exit(&mut exit_rx))
                        .await
                        .is_err()
                    {
                        log::debug!(
                            "Child {} still running after {:?}; killing",
                            self.pid_label(),
                            self.options.kill_timeout
                        );
                    }
                }
                Err(e) => log::debug!("Shutdown notification not delivered: {}", e),
            }
        }

        if let Err(e) = self.engine.dispose(self.options.dispose_grace).await {
            if e.is_disconnect() {
                log::debug!("Connection already closed during dispose: {}", e);
            } else {
                failures.push(RuntimeError::Teardown {
                    step: "dispose",
                    message: e.to_string(),
                });
            }
        }

        self.kill.cancel();
        let watcher = take(&self.watcher);
        if let Some(watcher) = watcher {
            match watcher.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(RuntimeError::Teardown {
                    step: "kill",
                    message: e.to_string(),
                }),
                Err(e) => failures.push(RuntimeError::Teardown {
                    step: "kill",
                    message: e.to_string(),
                }),
            }
        }

        if let Err(e) = remove_bootstrap(&self.bootstrap).await {
            failures.push(RuntimeError::Teardown {
                step: "delete bootstrap",
                message: e.to_string(),
            });
        }

        let stderr_task = take(&self.stderr_task);
        if let Some(task) = stderr_task {
            // stderr は子プロセス終了で閉じる。孫プロセスが握っている場合に備えて上限付き
            if tokio::time::timeout(self.options.dispose_grace, task).await.is_err() {
                log::debug!("stderr forwarder did not finish; detaching");
            }
        }

        if previous != RuntimeState::Failed {
            self.set_state(RuntimeState::Stopped);
        } else {
            self.set_state(RuntimeState::Failed);
        }

        let mut failures = failures.into_iter();
        match failures.next() {
            None => {
                log::debug!("{} runtime stopped", self.profile);
                Ok(())
            }
            Some(first) => {
                log::warn!("Teardown of {} runtime failed: {}", self.profile, first);
                for other in failures {
                    log::warn!("Additional teardown failure: {}", other);
                }
                Err(first)
            }
        }
    }

    fn set_state(&self, next: RuntimeState) -> RuntimeState {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = *state;
        if previous != next {
            log::trace!("runtime state {} -> {}", previous, next);
        }
        *state = next;
        previous
    }

    fn ensure_usable(&self, operation: &'static str) -> Result<(), RuntimeError> {
        match self.state() {
            state @ (RuntimeState::Stopping | RuntimeState::Stopped) => {
                Err(ProcessError::InvalidState {
                    operation,
                    state: state.as_str(),
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    /// A lost connection after the child is gone means the child died;
    /// report that instead of the bare transport error.
    async fn classify(&self, error: RpcError) -> RuntimeError {
        if !error.is_disconnect() {
            return error.into();
        }
        let status = match self.exit_state() {
            ChildExit::Exited(status) => status,
            ChildExit::Running if self.state() == RuntimeState::Running => {
                let mut exit_rx = self.exit_rx.clone();
                match tokio::time::timeout(EXIT_SETTLE, wait_exit(&mut exit_rx)).await {
                    Ok(status) => status,
                    Err(_) => return error.into(),
                }
            }
            ChildExit::Running => return error.into(),
        };
        if self.state() == RuntimeState::Running {
            log::warn!(
                "{} runtime (pid {}) exited unexpectedly",
                self.profile,
                self.pid_label()
            );
            self.set_state(RuntimeState::Failed);
        }
        ProcessError::Exited { status }.into()
    }

    fn pid_label(&self) -> String {
        match self.pid {
            Some(pid) => pid.to_string(),
            None => "?".to_string(),
        }
    }
}

impl Drop for ChildRuntime {
    fn drop(&mut self) {
        // kill_on_drop は watcher が Child を持っているので、ここで明示的に止める
        self.kill.cancel();
    }
}

impl fmt::Debug for ChildRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildRuntime")
            .field("profile", &self.profile)
            .field("script", &self.script)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

async fn remove_bootstrap(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn wait_exit(exit_rx: &mut watch::Receiver<ChildExit>) -> Option<ExitStatus> {
    match exit_rx.wait_for(ChildExit::is_exited).await {
        Ok(exit) => match *exit {
            ChildExit::Exited(status) => status,
            ChildExit::Running => None,
        },
        // watcher が送信せずに消えた
        Err(_) => None,
    }
}

/// Owns the child: reaps it when it exits on its own, or kills it when
/// `kill` fires. Publishes the outcome on `exit_tx`.
async fn watch_exit(
    mut child: Child,
    kill: CancellationToken,
    exit_tx: watch::Sender<ChildExit>,
    pid: Option<u32>,
) -> std::io::Result<()> {
    let mut kill_result = Ok(());
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            log::debug!("Killing child {:?}", pid);
            if let Err(e) = child.start_kill() {
                // 既に終了している場合は InvalidInput になる
                if e.kind() != std::io::ErrorKind::InvalidInput {
                    kill_result = Err(e);
                }
            }
            child.wait().await
        }
    };

    let status = match status {
        Ok(status) => {
            log::debug!("Child {:?} exited with {}", pid, status);
            Some(status)
        }
        Err(e) => {
            log::warn!("Failed to collect exit status of child {:?}: {}", pid, e);
            None
        }
    };
    exit_tx.send_replace(ChildExit::Exited(status));
    kill_result
}

/// Forward child stderr to the log. Never parsed as protocol.
async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let label = pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log::warn!("[child {}] {}", label, line),
            Ok(None) => break,
            Err(e) => {
                log::debug!("stderr of child {} unreadable: {}", label, e);
                break;
            }
        }
    }
}
