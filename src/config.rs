//! Runtime configuration.
//!
//! Everything here is plain data with defaults, loadable from a JSON file.
//! Durations are written as milliseconds in that file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::subprocess::launch::{Permissions, RuntimeConfigFile};

/// Timeouts, intervals and process settings for one child runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Deadline for ordinary calls made through the runtime handle.
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,

    /// Overall window for the child to answer `health`.
    #[serde(rename = "readiness_timeout_ms", with = "duration_ms")]
    pub readiness_timeout: Duration,

    /// Pause between `health` attempts.
    #[serde(rename = "health_interval_ms", with = "duration_ms")]
    pub health_interval: Duration,

    /// Deadline for a single `health` attempt.
    #[serde(rename = "health_call_timeout_ms", with = "duration_ms")]
    pub health_call_timeout: Duration,

    /// How long `stop` waits for in-flight handlers before closing the pipes.
    #[serde(rename = "dispose_grace_ms", with = "duration_ms")]
    pub dispose_grace: Duration,

    /// How long `stop` waits for the child to exit after the shutdown
    /// notification before killing it.
    #[serde(rename = "kill_timeout_ms", with = "duration_ms")]
    pub kill_timeout: Duration,

    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,

    /// Extra runtime arguments, placed before the bootstrap path.
    pub extra_args: Vec<String>,

    /// Where bootstrap files are written. `None` means the OS temp dir.
    pub bootstrap_dir: Option<PathBuf>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            readiness_timeout: Duration::from_secs(10),
            health_interval: Duration::from_millis(100),
            health_call_timeout: Duration::from_secs(1),
            dispose_grace: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(2),
            env: BTreeMap::new(),
            extra_args: Vec::new(),
            bootstrap_dir: None,
        }
    }
}

impl RuntimeOptions {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn with_dispose_grace(mut self, grace: Duration) -> Self {
        self.dispose_grace = grace;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_bootstrap_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bootstrap_dir = Some(dir.into());
        self
    }

    pub fn bootstrap_dir(&self) -> PathBuf {
        self.bootstrap_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Contents of a `--config-file` JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Explicit runtime binary; otherwise resolved from `DENO_PATH`/`PATH`.
    pub runtime: Option<PathBuf>,
    pub permissions: Permissions,
    pub runtime_config: RuntimeConfigFile,
    pub options: RuntimeOptions,
}

impl BridgeConfig {
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("invalid bridge config")
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
