use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use crate::jsonrpc::RpcError;

/// The child failed to start, crashed, or never became ready.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("runtime '{name}' not found: {reason}")]
    RuntimeNotFound { name: String, reason: String },

    #[error("script {path:?} is not accessible: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write bootstrap {path:?}: {source}")]
    Bootstrap {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {runtime:?}: {source}")]
    Spawn {
        runtime: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("child {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("child exited {}", describe_exit(.status))]
    Exited { status: Option<ExitStatus> },

    #[error("child did not answer health within {timeout:?}{}", last_error_suffix(.last_error))]
    ReadinessTimeout {
        timeout: Duration,
        last_error: Option<String>,
    },

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

fn describe_exit(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => format!("with {}", status),
        None => "(status unavailable)".to_string(),
    }
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(error) => format!(" (last error: {})", error),
        None => String::new(),
    }
}

/// Errors returned by [`ChildRuntime`](crate::subprocess::ChildRuntime).
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("teardown step '{step}' failed: {message}")]
    Teardown { step: &'static str, message: String },
}

impl RuntimeError {
    /// See [`RpcError::is_method_not_found`].
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, RuntimeError::Rpc(e) if e.is_method_not_found())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeError::Rpc(e) if e.is_timeout())
            || matches!(
                self,
                RuntimeError::Process(ProcessError::ReadinessTimeout { .. })
            )
    }

    /// JSON-RPC code when the child answered with an error.
    pub fn code(&self) -> Option<i32> {
        match self {
            RuntimeError::Rpc(e) => e.code(),
            _ => None,
        }
    }
}
