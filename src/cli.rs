//! Command-line interface definitions for ic-http-proxy.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Local proxy that serves Internet Computer domains through a certifying gateway.
///
/// `serve` runs the proxy process and `daemon` the privileged helper that
/// installs the root certificate and system proxy settings. The remaining
/// subcommands talk to a running proxy over its control socket.
#[derive(Parser, Debug)]
#[command(name = "ic-http-proxy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for ic-http-proxy.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the proxy servers until stopped.
    Serve {
        /// Enable the system integration once the listeners are up.
        #[arg(long = "auto-enable")]
        auto_enable: bool,
    },

    /// Run the privileged helper that manages system integration.
    Daemon,

    /// Check whether the proxy process answers on its control socket.
    Ping,

    /// Show whether the proxy is running and whether it is shutting down.
    Status,

    /// Ask the proxy to enable the system integration.
    Enable {
        /// Return as soon as the request is acknowledged.
        #[arg(long = "no-wait")]
        no_wait: bool,
    },

    /// Ask the proxy to shut down.
    Stop {
        /// Return as soon as the request is acknowledged.
        #[arg(long = "no-wait")]
        no_wait: bool,
    },
}

impl Commands {
    /// True for the long-running process roles.
    pub fn is_service(&self) -> bool {
        matches!(self, Commands::Serve { .. } | Commands::Daemon)
    }
}

impl Cli {
    /// Log filter used when `RUST_LOG` is not set.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 if self.command.is_service() => "info",
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
