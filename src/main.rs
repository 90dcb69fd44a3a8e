//! Relay validator entrypoint.
//!
//! Commands:
//! - `listen` — follow every configured chain, sign confirmed messages, and
//!   publish signatures to the configured relays. Runs until a fatal error
//!   (non-zero exit, to be restarted by the operator's supervisor) or a
//!   shutdown signal.
//! - `rpc-proxy` — expose the certificate-authenticated X-chain full node
//!   over plain HTTP for the follower's `rpc_url`.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` (or `--config`) points at the JSON configuration file
//! - `OTEL_*` variables enable span export to a collector

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;

use warp_validator::config::Config;
use warp_validator::telemetry::Telemetry;
use warp_validator::{proxy, run};

#[derive(Parser, Debug)]
#[command(name = "warp-validator")]
#[command(about = "warp.green cross-chain message relay validator")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow every configured chain, sign messages, publish signatures
    Listen {
        /// Log connection errors in detail while waiting for nodes at startup
        #[arg(long)]
        log_startup_connection_errors: bool,
    },
    /// Expose the TLS-authenticated full node over plain HTTP
    RpcProxy,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenv().ok();
    let _telemetry = Telemetry::init();

    let cli = Cli::parse();
    let result = run_command(cli).await;
    if let Err(e) = result {
        tracing::error!(error = %e, "fatal error");
        process::exit(1);
    }
}

async fn run_command(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&cli.config)?;
    match cli.command {
        Command::Listen {
            log_startup_connection_errors,
        } => run::listen(config, log_startup_connection_errors).await,
        Command::RpcProxy => {
            let proxy_config = config
                .proxy
                .ok_or("config has no proxy section; rpc-proxy needs one")?;
            proxy::serve(&proxy_config).await?;
            Ok(())
        }
    }
}
