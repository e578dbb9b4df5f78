//! Client subcommands.
//!
//! `ping`, `status`, `enable` and `stop` talk to a running proxy over its
//! control socket and print a one-line result.

use anyhow::{Context, Result, bail};
use std::path::Path;

use crate::cli::Commands;
use crate::config::Config;
use crate::control::{IpcClient, IpcRequest, ProxyMessage, RunningStatus, StartedStatus};

/// Run a client subcommand against the proxy configured in `config`.
pub fn handle_command(command: &Commands, config: &Config) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let client = IpcClient::new(&config.ipc.proxy_socket);
    let output = rt.block_on(run_client_command(&client, command))?;
    println!("{}", output);
    Ok(())
}

/// Execute `command` and return what should be printed.
pub async fn run_client_command(client: &IpcClient, command: &Commands) -> Result<String> {
    match command {
        Commands::Ping => {
            if client.ping().await {
                Ok("pong".to_string())
            } else {
                bail!("No proxy answering on {}", client.path().display())
            }
        }
        Commands::Status => status(client).await,
        Commands::Enable { no_wait } => {
            send(client, ProxyMessage::Enable, *no_wait).await?;
            Ok(if *no_wait {
                "Enable requested".to_string()
            } else {
                "Proxy enabled".to_string()
            })
        }
        Commands::Stop { no_wait } => {
            send(client, ProxyMessage::Stop, *no_wait).await?;
            Ok(if *no_wait {
                "Stop requested".to_string()
            } else {
                "Proxy stopped".to_string()
            })
        }
        Commands::Serve { .. } | Commands::Daemon => {
            bail!("{:?} is not a client command", command)
        }
    }
}

async fn status(client: &IpcClient) -> Result<String> {
    let Ok(started) = client.send(&IpcRequest::new(ProxyMessage::IsStarted.as_str())).await
    else {
        return Ok("stopped".to_string());
    };
    let shutting_down = started
        .data_as::<StartedStatus>()
        .is_some_and(|status| status.is_shutting_down);
    if shutting_down {
        return Ok("shutting down".to_string());
    }

    let running = client
        .send(&IpcRequest::new(ProxyMessage::IsRunning.as_str()))
        .await
        .context("Proxy stopped answering")?;
    let enabled = running
        .data_as::<RunningStatus>()
        .is_some_and(|status| status.running);

    Ok(format!("started, {}", if enabled { "enabled" } else { "not enabled" }))
}

async fn send(client: &IpcClient, message: ProxyMessage, no_wait: bool) -> Result<()> {
    let request = IpcRequest::new(message.as_str()).skip_wait(no_wait);
    let response = client
        .send(&request)
        .await
        .with_context(|| socket_context(client.path()))?;
    if !response.processed {
        bail!(
            "Proxy refused {}: {}",
            message.as_str(),
            response.err.unwrap_or_default()
        );
    }
    Ok(())
}

fn socket_context(path: &Path) -> String {
    format!("Failed to reach the proxy on {}", path.display())
}
