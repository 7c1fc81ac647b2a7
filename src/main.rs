//! denobridge - host side of a JSON-RPC bridge to a Deno child process
//!
//! Command-line usage:
//!   denobridge bootstrap --profile <p> --script <path>
//!   denobridge call --profile <p> --script <path> [options] <method> [params-json]

use denobridge::cli::run_cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    run_cli().await
}
