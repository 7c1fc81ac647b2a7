//! Generated child-side glue.
//!
//! The child runtime does not run the user's script directly. It runs a small
//! generated TypeScript module that imports the script's default export and
//! exposes a fixed method table for the requested [`BootstrapProfile`].

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const PRELUDE: &str = include_str!("assets/prelude.ts");

/// Method every profile exposes for readiness probing.
pub const HEALTH_METHOD: &str = "health";
/// Notification the Action profile sends from child to host.
pub const INVOKE_PROGRESS_METHOD: &str = "invokeProgress";
/// Notification asking the child to drain and exit.
pub const SHUTDOWN_METHOD: &str = "shutdown";

/// The fixed method set the generated glue implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapProfile {
    DataSource,
    StatefulResource,
    Action,
    EphemeralResource,
}

impl BootstrapProfile {
    pub const ALL: [BootstrapProfile; 4] = [
        BootstrapProfile::DataSource,
        BootstrapProfile::StatefulResource,
        BootstrapProfile::Action,
        BootstrapProfile::EphemeralResource,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            BootstrapProfile::DataSource => "data-source",
            BootstrapProfile::StatefulResource => "resource",
            BootstrapProfile::Action => "action",
            BootstrapProfile::EphemeralResource => "ephemeral-resource",
        }
    }

    /// Methods the user implementation must define.
    pub fn required_methods(self) -> &'static [&'static str] {
        match self {
            BootstrapProfile::DataSource => &["read"],
            BootstrapProfile::StatefulResource => &["create", "read", "update", "delete"],
            BootstrapProfile::Action => &["invoke"],
            BootstrapProfile::EphemeralResource => &["open"],
        }
    }

    /// Methods wired only when the implementation defines them. Calls to a
    /// missing optional method answer -32601.
    pub fn optional_methods(self) -> &'static [&'static str] {
        match self {
            BootstrapProfile::StatefulResource => &["modifyPlan"],
            BootstrapProfile::EphemeralResource => &["renew", "close"],
            BootstrapProfile::DataSource | BootstrapProfile::Action => &[],
        }
    }

    pub fn is_optional(self, method: &str) -> bool {
        self.optional_methods().contains(&method)
    }

    /// Pick the profile for a host capability name.
    pub fn for_capability(capability: &str) -> Option<Self> {
        capability.parse().ok()
    }
}

impl fmt::Display for BootstrapProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability '{0}' (expected data-source, resource, action or ephemeral-resource)")]
pub struct UnknownProfile(pub String);

impl FromStr for BootstrapProfile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "data-source" | "datasource" => Ok(BootstrapProfile::DataSource),
            "resource" | "stateful-resource" => Ok(BootstrapProfile::StatefulResource),
            "action" => Ok(BootstrapProfile::Action),
            "ephemeral-resource" | "ephemeral" => Ok(BootstrapProfile::EphemeralResource),
            _ => Err(UnknownProfile(s.to_string())),
        }
    }
}

/// Render the glue module for `profile` wired to the script at `script_path`.
///
/// Pure: the same inputs always produce the same text.
pub fn render_bootstrap(profile: BootstrapProfile, script_path: &Path) -> String {
    let import_url = file_url(script_path);
    let mut out = String::with_capacity(PRELUDE.len() + 1024);

    out.push_str("// Generated by denobridge. Do not edit.\n");
    out.push_str(&format!("// profile: {}\n", profile));
    out.push_str(&format!(
        "import userModule from {};\n\n",
        ts_string_literal(&import_url)
    ));
    out.push_str(PRELUDE);
    out.push('\n');
    out.push_str(
        "const impl = (typeof userModule === \"function\" ? new (userModule as any)() : userModule) as Record<string, unknown>;\n",
    );
    out.push_str("const handlers = new Map<string, Handler>();\n");
    out.push_str(&format!(
        "handlers.set({}, () => ({{ ok: true }}));\n",
        ts_string_literal(HEALTH_METHOD)
    ));

    for method in profile.required_methods() {
        if profile == BootstrapProfile::Action && *method == "invoke" {
            continue;
        }
        out.push_str(&format!(
            "{{\n  const h = bind(impl, {name});\n  if (!h) throw new Error({missing});\n  handlers.set({name}, h);\n}}\n",
            name = ts_string_literal(method),
            missing = ts_string_literal(&format!(
                "{} implementation must define '{}'",
                profile, method
            )),
        ));
    }

    for method in profile.optional_methods() {
        out.push_str(&format!(
            "{{\n  const h = bind(impl, {name});\n  if (h) handlers.set({name}, h);\n}}\n",
            name = ts_string_literal(method),
        ));
    }

    if profile == BootstrapProfile::Action {
        // invoke は進捗通知用のハンドルを受け取る
        out.push_str(&format!(
            "{{\n  const fn = impl[\"invoke\"];\n  if (typeof fn !== \"function\") throw new Error({missing});\n  const progress = {{ send: (message: unknown) => notify({progress}, message) }};\n  handlers.set(\"invoke\", (params: Params) => fn.call(impl, params, progress));\n}}\n",
            missing = ts_string_literal("action implementation must define 'invoke'"),
            progress = ts_string_literal(INVOKE_PROGRESS_METHOD),
        ));
    }

    out.push_str("\nawait serve(handlers);\n");
    out
}

/// Deterministic location of the glue file for (`script_path`, `profile`).
///
/// The same script and profile always map to the same file name, which makes
/// leftover files easy to attribute.
pub fn bootstrap_path(dir: &Path, profile: BootstrapProfile, script_path: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(script_path.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(profile.slug().as_bytes());
    let digest = hex::encode(hasher.finalize());

    dir.join(format!("denobridge-{}-{}.ts", profile.slug(), &digest[..16]))
}

/// Render the glue and write it to its deterministic path under `dir`.
pub async fn materialize(
    dir: &Path,
    profile: BootstrapProfile,
    script_path: &Path,
) -> io::Result<PathBuf> {
    let path = bootstrap_path(dir, profile, script_path);
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(&path, render_bootstrap(profile, script_path)).await?;
    log::debug!("Wrote {} bootstrap to {}", profile, path.display());
    Ok(path)
}

fn file_url(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/");
    if text.starts_with('/') {
        format!("file://{}", text)
    } else {
        // Windows drive paths: C:/...
        format!("file:///{}", text)
    }
}

fn ts_string_literal(text: &str) -> String {
    // JSON string syntax is valid TypeScript string syntax
    serde_json::Value::String(text.to_string()).to_string()
}
