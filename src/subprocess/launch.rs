//! Launch arguments for the child runtime.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Names of config files the runtime picks up next to a script.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["deno.json", "deno.jsonc"];

/// Permission kinds understood by the runtime's `--allow-*` / `--deny-*` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Read,
    Write,
    Net,
    Env,
    Run,
    Ffi,
    Sys,
    Import,
}

impl PermissionKind {
    pub fn flag_name(self) -> &'static str {
        match self {
            PermissionKind::Read => "read",
            PermissionKind::Write => "write",
            PermissionKind::Net => "net",
            PermissionKind::Env => "env",
            PermissionKind::Run => "run",
            PermissionKind::Ffi => "ffi",
            PermissionKind::Sys => "sys",
            PermissionKind::Import => "import",
        }
    }
}

/// Sandbox permissions granted to the child.
///
/// A kind mapped to an empty list is granted without restriction; a
/// non-empty list scopes it (`--allow-read=/a,/b`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    /// Grant everything (`--allow-all`). Deny lists still apply.
    pub all: bool,
    pub allow: HashMap<PermissionKind, Vec<String>>,
    pub deny: HashMap<PermissionKind, Vec<String>>,
    /// Let the runtime prompt interactively. Off by default: there is no
    /// terminal on the other end of the child's stdin.
    pub prompt: bool,
}

impl Permissions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// An empty scope grants the whole kind and wins over any scoped grant.
    pub fn allow(mut self, kind: PermissionKind, scope: impl IntoIterator<Item = impl Into<String>>) -> Self {
        merge_scope(&mut self.allow, kind, scope.into_iter().map(Into::into).collect());
        self
    }

    pub fn deny(mut self, kind: PermissionKind, scope: impl IntoIterator<Item = impl Into<String>>) -> Self {
        merge_scope(&mut self.deny, kind, scope.into_iter().map(Into::into).collect());
        self
    }

    /// Flags in a stable order (kinds sorted by flag name).
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.all {
            args.push("--allow-all".to_string());
        } else {
            push_flags(&mut args, "allow", &self.allow);
        }
        push_flags(&mut args, "deny", &self.deny);
        if !self.prompt {
            args.push("--no-prompt".to_string());
        }
        args
    }
}

fn merge_scope(flags: &mut HashMap<PermissionKind, Vec<String>>, kind: PermissionKind, scope: Vec<String>) {
    match flags.entry(kind) {
        Entry::Vacant(entry) => {
            entry.insert(scope);
        }
        Entry::Occupied(mut entry) => {
            let existing = entry.get_mut();
            if scope.is_empty() {
                existing.clear();
            } else if !existing.is_empty() {
                existing.extend(scope);
            }
        }
    }
}

fn push_flags(args: &mut Vec<String>, verb: &str, flags: &HashMap<PermissionKind, Vec<String>>) {
    let mut kinds: Vec<_> = flags.iter().collect();
    kinds.sort_by_key(|(kind, _)| kind.flag_name());
    for (kind, scope) in kinds {
        if scope.is_empty() {
            args.push(format!("--{}-{}", verb, kind.flag_name()));
        } else {
            args.push(format!("--{}-{}={}", verb, kind.flag_name(), scope.join(",")));
        }
    }
}

/// Which runtime config file to pass, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeConfigFile {
    /// Look for `deno.json(c)` walking up from the script directory.
    #[default]
    Discover,
    /// Use this file.
    Path(PathBuf),
    /// Pass `--no-config`.
    Disabled,
}

/// Everything needed to build the child's command line.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub runtime: PathBuf,
    pub bootstrap: PathBuf,
    pub permissions: Permissions,
    pub config_file: Option<PathBuf>,
    pub no_config: bool,
    pub extra_args: Vec<String>,
}

impl LaunchSpec {
    /// `run [--quiet] [config] [permissions] [extra] <bootstrap>`
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--quiet".to_string()];
        if self.no_config {
            args.push("--no-config".to_string());
        } else if let Some(config) = &self.config_file {
            args.push(format!("--config={}", config.display()));
        }
        args.extend(self.permissions.to_args());
        args.extend(self.extra_args.iter().cloned());
        args.push(self.bootstrap.to_string_lossy().into_owned());
        args
    }

    pub fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.runtime);
        command.args(self.args());
        command
    }
}

/// Per-script memo of config file discovery.
///
/// Explicit object rather than a global so callers (and tests) control its
/// lifetime; [`ConfigFileCache::clear`] drops every cached answer.
#[derive(Debug, Default)]
pub struct ConfigFileCache {
    entries: Mutex<HashMap<PathBuf, Option<PathBuf>>>,
}

impl ConfigFileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nearest config file for `script_path`, cached per script.
    pub fn discover(&self, script_path: &Path) -> Option<PathBuf> {
        if let Some(hit) = self.lock().get(script_path) {
            return hit.clone();
        }
        let found = discover_config_file(script_path);
        log::debug!(
            "Config discovery for {}: {:?}",
            script_path.display(),
            found
        );
        self.lock().insert(script_path.to_path_buf(), found.clone());
        found
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Option<PathBuf>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Walk up from the script's directory looking for a runtime config file.
pub fn discover_config_file(script_path: &Path) -> Option<PathBuf> {
    let mut dir = script_path.parent();
    while let Some(current) = dir {
        for name in CONFIG_FILE_NAMES {
            let candidate = current.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        dir = current.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_permissions_only_disable_prompt() {
        assert_eq!(Permissions::none().to_args(), vec!["--no-prompt"]);
    }

    #[test]
    fn test_scoped_and_unscoped_permissions() {
        let permissions = Permissions::none()
            .allow(PermissionKind::Read, ["/data", "/etc/hosts"])
            .allow(PermissionKind::Net, Vec::<String>::new())
            .deny(PermissionKind::Env, ["AWS_SECRET_ACCESS_KEY"]);

        assert_eq!(
            permissions.to_args(),
            vec![
                "--allow-net",
                "--allow-read=/data,/etc/hosts",
                "--deny-env=AWS_SECRET_ACCESS_KEY",
                "--no-prompt",
            ]
        );
    }

    #[test]
    fn test_bare_kind_widens_scoped_grant() {
        let widened = Permissions::none()
            .allow(PermissionKind::Read, ["/tmp"])
            .allow(PermissionKind::Read, Vec::<String>::new());
        assert_eq!(widened.to_args(), vec!["--allow-read", "--no-prompt"]);

        // 後から範囲を足しても狭まらない
        let still_wide = widened
            .allow(PermissionKind::Read, ["/data"])
            .deny(PermissionKind::Net, ["a.example"])
            .deny(PermissionKind::Net, ["b.example"]);
        assert_eq!(
            still_wide.to_args(),
            vec!["--allow-read", "--deny-net=a.example,b.example", "--no-prompt"]
        );
    }

    #[test]
    fn test_allow_all_keeps_denies() {
        let permissions = Permissions::all().deny(PermissionKind::Run, Vec::<String>::new());
        assert_eq!(
            permissions.to_args(),
            vec!["--allow-all", "--deny-run", "--no-prompt"]
        );
    }

    #[test]
    fn test_permissions_from_json() {
        let permissions: Permissions = serde_json::from_str(
            r#"{"allow": {"read": ["/tmp"], "env": []}, "prompt": true}"#,
        )
        .unwrap();
        assert_eq!(permissions.to_args(), vec!["--allow-env", "--allow-read=/tmp"]);
    }

    #[test]
    fn test_launch_args_order() {
        let spec = LaunchSpec {
            runtime: PathBuf::from("/usr/bin/deno"),
            bootstrap: PathBuf::from("/tmp/denobridge-action-0123.ts"),
            permissions: Permissions::none().allow(PermissionKind::Net, ["example.com"]),
            config_file: Some(PathBuf::from("/work/deno.json")),
            no_config: false,
            extra_args: vec!["--cached-only".to_string()],
        };

        assert_eq!(
            spec.args(),
            vec![
                "run",
                "--quiet",
                "--config=/work/deno.json",
                "--allow-net=example.com",
                "--no-prompt",
                "--cached-only",
                "/tmp/denobridge-action-0123.ts",
            ]
        );
    }

    #[test]
    fn test_no_config_wins_over_path() {
        let spec = LaunchSpec {
            runtime: PathBuf::from("deno"),
            bootstrap: PathBuf::from("b.ts"),
            permissions: Permissions::none(),
            config_file: Some(PathBuf::from("deno.json")),
            no_config: true,
            extra_args: Vec::new(),
        };
        assert_eq!(spec.args()[2], "--no-config");
        assert!(!spec.args().iter().any(|a| a.starts_with("--config=")));
    }

    #[test]
    fn test_discovery_walks_up_and_is_cached() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(root.path().join("a/deno.jsonc"), "{}").unwrap();
        let script = nested.join("main.ts");

        let cache = ConfigFileCache::new();
        assert_eq!(cache.discover(&script), Some(root.path().join("a/deno.jsonc")));
        assert_eq!(cache.len(), 1);

        // キャッシュはファイル削除後も前の結果を返す
        fs::remove_file(root.path().join("a/deno.jsonc")).unwrap();
        assert_eq!(cache.discover(&script), Some(root.path().join("a/deno.jsonc")));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.discover(&script), discover_config_file(&script));
    }
}
