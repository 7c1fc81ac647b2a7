pub mod cli;
pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod subprocess;
pub mod value;

// 公開API
pub use config::{BridgeConfig, RuntimeOptions};
pub use error::{ProcessError, RuntimeError};
pub use jsonrpc::{HandlerTable, JsonRpcEngine, JsonRpcError, RpcError};
pub use subprocess::{BootstrapProfile, ChildRuntime, Permissions, RuntimeConfigFile};
pub use value::DynamicValue;
