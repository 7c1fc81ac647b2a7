//! `denobridge` command line

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::debug;
use serde_json::Value;

use crate::config::BridgeConfig;
use crate::subprocess::launch::{PermissionKind, RuntimeConfigFile};
use crate::subprocess::resolver::{FixedRuntime, PathRuntime, RuntimeResolver};
use crate::subprocess::{render_bootstrap, BootstrapProfile, ChildRuntime};
use crate::value::DynamicValue;

/// denobridge - run TypeScript implementations behind a JSON-RPC child process
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the generated glue for a profile and script
    Bootstrap {
        #[arg(short, long)]
        profile: BootstrapProfile,

        #[arg(short, long)]
        script: PathBuf,
    },

    /// Start the child, perform one call, print the result and stop
    Call(CallArgs),
}

#[derive(Debug, Args)]
pub struct CallArgs {
    #[arg(short, long)]
    pub profile: BootstrapProfile,

    #[arg(short, long)]
    pub script: PathBuf,

    /// Runtime binary (defaults to $DENO_PATH, then `deno` on PATH)
    #[arg(long)]
    pub runtime: Option<PathBuf>,

    /// JSON file with permissions, runtime config and options
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Runtime config file to pass instead of discovering deno.json
    #[arg(long, conflicts_with = "no_config")]
    pub deno_config: Option<PathBuf>,

    /// Do not pass any runtime config file
    #[arg(long)]
    pub no_config: bool,

    /// Grant a permission: KIND or KIND=SCOPE[,SCOPE...] (e.g. read=/tmp)
    #[arg(long = "allow", value_name = "KIND[=SCOPE]", value_parser = parse_grant)]
    pub allow: Vec<Grant>,

    /// Deny a permission: KIND or KIND=SCOPE[,SCOPE...]
    #[arg(long = "deny", value_name = "KIND[=SCOPE]", value_parser = parse_grant)]
    pub deny: Vec<Grant>,

    /// Grant every permission
    #[arg(long)]
    pub allow_all: bool,

    /// Call timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Treat "method not found" as an empty result
    #[arg(long)]
    pub optional: bool,

    pub method: String,

    /// Params as JSON text
    pub params: Option<String>,
}

/// One `--allow`/`--deny` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub kind: PermissionKind,
    pub scope: Vec<String>,
}

pub fn parse_grant(text: &str) -> Result<Grant, String> {
    let (kind, scope) = match text.split_once('=') {
        Some((kind, scope)) => (kind, scope),
        None => (text, ""),
    };
    let kind: PermissionKind = serde_json::from_value(serde_json::Value::String(
        kind.trim().to_ascii_lowercase(),
    ))
    .map_err(|_| format!("unknown permission kind '{}'", kind))?;
    let scope = scope
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    Ok(Grant { kind, scope })
}

/// CLI実行エントリーポイント
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Bootstrap { profile, script } => {
            print!("{}", render_bootstrap(profile, &script));
            Ok(())
        }
        Command::Call(args) => run_call(args).await,
    }
}

/// Merge the config file with command line overrides.
pub fn build_config(args: &CallArgs) -> Result<BridgeConfig> {
    let mut config = match &args.config_file {
        Some(path) => BridgeConfig::from_json_file(path)?,
        None => BridgeConfig::default(),
    };

    if let Some(runtime) = &args.runtime {
        config.runtime = Some(runtime.clone());
    }
    if let Some(path) = &args.deno_config {
        config.runtime_config = RuntimeConfigFile::Path(path.clone());
    }
    if args.no_config {
        config.runtime_config = RuntimeConfigFile::Disabled;
    }
    if args.allow_all {
        config.permissions.all = true;
    }
    for grant in &args.allow {
        config.permissions = config
            .permissions
            .allow(grant.kind, grant.scope.iter().cloned());
    }
    for grant in &args.deny {
        config.permissions = config
            .permissions
            .deny(grant.kind, grant.scope.iter().cloned());
    }
    if let Some(ms) = args.timeout_ms {
        config.options.call_timeout = Duration::from_millis(ms);
    }
    Ok(config)
}

/// Params come from the command line as JSON text; only arrays and objects
/// are valid JSON-RPC params.
fn parse_params(text: Option<&str>) -> Result<Option<Value>> {
    let Some(text) = text else {
        return Ok(None);
    };
    let value: DynamicValue = serde_json::from_str(text).context("params must be valid JSON")?;
    match value {
        DynamicValue::List(_) | DynamicValue::Object(_) => Ok(Some(value.to_generic())),
        _ => bail!("params must be a JSON array or object, got {}", text.trim()),
    }
}

async fn run_call(args: CallArgs) -> Result<()> {
    let config = build_config(&args)?;
    debug!("Effective config: {:?}", config);

    let params = parse_params(args.params.as_deref())?;

    let resolver: Arc<dyn RuntimeResolver> = match &config.runtime {
        Some(path) => Arc::new(FixedRuntime(path.clone())),
        None => Arc::new(PathRuntime::default()),
    };

    let runtime = ChildRuntime::builder(args.profile, &args.script)
        .runtime_config(config.runtime_config)
        .permissions(config.permissions)
        .options(config.options)
        .resolver(resolver)
        .start()
        .await
        .with_context(|| format!("failed to start {}", args.script.display()))?;

    let outcome = if args.optional {
        runtime.call_optional(&args.method, params).await
    } else {
        runtime.call(&args.method, params).await.map(Some)
    };

    // 呼び出しの結果を優先し、停止の失敗は警告に留める
    if let Err(e) = runtime.stop().await {
        log::warn!("Stop failed: {}", e);
    }

    match outcome {
        Ok(Some(result)) => {
            println!("{}", DynamicValue::from_generic(&result));
            Ok(())
        }
        Ok(None) => {
            eprintln!("'{}' is not implemented by the script", args.method);
            Ok(())
        }
        Err(e) => Err(anyhow!(e).context(format!("call to '{}' failed", args.method))),
    }
}
