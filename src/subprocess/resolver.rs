use std::path::PathBuf;

use async_trait::async_trait;
use which::which;

use crate::error::ProcessError;

/// Environment variable that overrides runtime lookup.
pub const RUNTIME_PATH_ENV: &str = "DENO_PATH";

/// Supplies the path of the child runtime executable.
///
/// Downloading or caching the runtime is the resolver's business; the
/// orchestrator only needs a path it can spawn.
#[async_trait]
pub trait RuntimeResolver: Send + Sync {
    async fn resolve(&self) -> Result<PathBuf, ProcessError>;
}

/// A runtime path known up front.
#[derive(Debug, Clone)]
pub struct FixedRuntime(pub PathBuf);

#[async_trait]
impl RuntimeResolver for FixedRuntime {
    async fn resolve(&self) -> Result<PathBuf, ProcessError> {
        Ok(self.0.clone())
    }
}

/// `$DENO_PATH` if it points at an existing file, otherwise `deno` on `PATH`.
#[derive(Debug, Clone)]
pub struct PathRuntime {
    pub name: String,
}

impl Default for PathRuntime {
    fn default() -> Self {
        Self {
            name: "deno".to_string(),
        }
    }
}

#[async_trait]
impl RuntimeResolver for PathRuntime {
    async fn resolve(&self) -> Result<PathBuf, ProcessError> {
        if let Some(path) = std::env::var_os(RUNTIME_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.is_file() {
                log::debug!("Using runtime from {}: {}", RUNTIME_PATH_ENV, path.display());
                return Ok(path);
            }
            log::warn!(
                "{} points at {}, which does not exist; falling back to PATH",
                RUNTIME_PATH_ENV,
                path.display()
            );
        }

        which(&self.name).map_err(|e| ProcessError::RuntimeNotFound {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}
