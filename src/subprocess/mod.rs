//! 子プロセス（Deno ランタイム）の起動・監視・停止
//!
//! - [`bootstrap`]: プロファイルごとの生成グルーコード
//! - [`launch`]: 起動引数（パーミッション・設定ファイル）
//! - [`resolver`]: ランタイム実行ファイルの解決
//! - [`runtime`]: ChildRuntime - 状態遷移・ヘルスチェック・終了監視・後片付け

pub mod bootstrap;
pub mod launch;
pub mod resolver;
pub mod runtime;

pub use bootstrap::{render_bootstrap, BootstrapProfile};
pub use launch::{ConfigFileCache, LaunchSpec, PermissionKind, Permissions, RuntimeConfigFile};
pub use resolver::{FixedRuntime, PathRuntime, RuntimeResolver};
pub use runtime::{ChildExit, ChildRuntime, RuntimeBuilder, RuntimeState};
