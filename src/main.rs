//! ic-http-proxy: local proxy serving Internet Computer domains.
//!
//! One binary, three roles:
//!
//! - `serve`: the proxy process (net proxy, IC gateway, PAC server and
//!   control socket). Runs as the desktop user.
//! - `daemon`: the privileged helper that trusts the root CA and points the
//!   system proxy settings at the PAC server. Spawned by `serve` on enable.
//! - `ping`, `status`, `enable`, `stop`: clients of a running `serve`.
//!
//! Logs go to stderr; client commands print their result on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use ic_http_proxy::{
    cli::{Cli, Commands},
    cli_handler,
    config::ConfigLoader,
    orchestrator,
};
use tracing::{debug, error};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    debug!("Parsed CLI arguments: {:?}", cli);

    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;
    debug!("Loaded configuration: {:?}", config);

    match &cli.command {
        Commands::Serve { .. } => orchestrator::run_proxy(config, cli.config.as_deref()),
        Commands::Daemon => orchestrator::run_daemon(&config),
        command => cli_handler::handle_command(command, &config),
    }
}

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level follows `-v`:
/// - 0: info for `serve`/`daemon`, warn for client commands
/// - 1 (-v): info
/// - 2 (-vv): debug
/// - 3+ (-vvv): trace
fn init_tracing(cli: &Cli) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
