//! Proxy-side handle on the privileged daemon.

use super::error::{DaemonError, DaemonResult};
use crate::config::DaemonConfig;
use crate::control::{DaemonMessage, EnableProxyPayload, IpcClient, IpcRequest, ProxyEnabledStatus};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

/// Starts the daemon on demand and relays commands to it.
pub struct DaemonProcess {
    client: IpcClient,
    command: Vec<String>,
    activation_timeout: Duration,
    activation_interval: Duration,
    started: AtomicBool,
}

impl DaemonProcess {
    /// Handle for the daemon listening on `socket`, launched with `command`.
    pub fn new(socket: impl AsRef<Path>, command: Vec<String>, config: &DaemonConfig) -> Self {
        Self {
            client: IpcClient::new(socket),
            command,
            activation_timeout: config.activation_timeout(),
            activation_interval: config.activation_interval(),
            started: AtomicBool::new(false),
        }
    }

    /// True when the daemon answers `ping`.
    pub async fn is_running(&self) -> bool {
        self.client.ping().await
    }

    /// Make sure the daemon is up, spawning it when it does not answer.
    pub async fn start(&self) -> DaemonResult<()> {
        self.started.store(true, Ordering::SeqCst);
        if self.is_running().await {
            debug!("Daemon already running");
            return Ok(());
        }

        self.spawn()?;
        self.wait_until_active().await
    }

    fn spawn(&self) -> DaemonResult<()> {
        let cmd = self.command.join(" ");
        let Some((program, args)) = self.command.split_first() else {
            return Err(DaemonError::MissingRequirements(
                "No daemon command configured".to_string(),
            ));
        };

        info!("Spawning daemon: {}", cmd);
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DaemonError::Spawn { cmd, source: e })?;
        Ok(())
    }

    async fn wait_until_active(&self) -> DaemonResult<()> {
        let deadline = Instant::now() + self.activation_timeout;
        loop {
            if self.is_running().await {
                info!("Daemon is active");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DaemonError::MissingRequirements(
                    "Daemon process failed to activate".to_string(),
                ));
            }
            tokio::time::sleep(self.activation_interval).await;
        }
    }

    /// Ask the daemon to trust the CA and route the system through the proxy.
    pub async fn enable_proxy(&self, payload: &EnableProxyPayload) -> DaemonResult<()> {
        let request = IpcRequest::with_payload(DaemonMessage::EnableProxy.as_str(), payload)?;
        let response = self.client.send(&request).await?;
        if !response.processed {
            return Err(DaemonError::MissingRequirements(format!(
                "Failed to enable proxy({})",
                response.err.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Whether the daemon reports the proxy as attached.
    pub async fn is_proxy_enabled(&self) -> DaemonResult<bool> {
        let response = self
            .client
            .send(&IpcRequest::new(DaemonMessage::IsProxyEnabled.as_str()))
            .await?;
        Ok(response
            .data_as::<ProxyEnabledStatus>()
            .is_some_and(|status| status.enabled))
    }

    /// Ask a daemon started by us to detach and exit. Errors are ignored.
    pub async fn shutdown(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        info!("Shutting down daemon");
        let request = IpcRequest::new(DaemonMessage::DisableProxy.as_str()).skip_wait(true);
        if let Err(e) = self.client.send(&request).await {
            debug!("Daemon did not take disable-proxy: {}", e);
        }
    }
}

/// Argv that launches this executable as the daemon.
///
/// On Linux the daemon is started through `pkexec`, passing on the desktop
/// user's `HOME` and `LOGNAME` so it can update their settings.
pub fn default_daemon_command(config_path: Option<&Path>) -> DaemonResult<Vec<String>> {
    let exe: PathBuf = std::env::current_exe().map_err(|e| DaemonError::Spawn {
        cmd: "current executable".to_string(),
        source: e,
    })?;

    let mut command = Vec::new();
    let logname = std::env::var("LOGNAME").unwrap_or_default();
    if cfg!(target_os = "linux") && logname != "root" {
        command.push("pkexec".to_string());
        command.push("env".to_string());
        if let Some(home) = dirs::home_dir() {
            command.push(format!("HOME={}", home.display()));
        }
        if !logname.is_empty() {
            command.push(format!("LOGNAME={}", logname));
        }
    }

    command.push(exe.to_string_lossy().into_owned());
    command.push("daemon".to_string());
    if let Some(path) = config_path {
        command.push("--config".to_string());
        command.push(path.to_string_lossy().into_owned());
    }
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Endpoint, HandlerError, IpcServer, MessageHandler};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::sync::{Mutex, watch};

    #[derive(Default)]
    struct RecordingDaemon {
        received: Mutex<Vec<IpcRequest>>,
        reject_enable: bool,
    }

    #[async_trait]
    impl MessageHandler for RecordingDaemon {
        async fn handle(&self, request: IpcRequest) -> Result<Option<Value>, HandlerError> {
            self.received.lock().await.push(request.clone());
            match request.kind.as_str() {
                "enable-proxy" if self.reject_enable => Err("trust store locked".into()),
                "is-proxy-enabled" => Ok(Some(json!({ "enabled": true }))),
                _ => Ok(None),
            }
        }
    }

    fn fast_config() -> DaemonConfig {
        DaemonConfig {
            activation_timeout_ms: 200,
            activation_interval_ms: 20,
            ..Default::default()
        }
    }

    fn payload() -> EnableProxyPayload {
        EnableProxyPayload {
            host: "127.0.0.1".to_string(),
            port: 4050,
            certificate_path: PathBuf::from("/tmp/ca.cert"),
            common_name: "Root".to_string(),
            pac: Endpoint {
                host: "127.0.0.1".to_string(),
                port: 4049,
            },
        }
    }

    async fn spawn_daemon(
        socket: &Path,
        handler: Arc<RecordingDaemon>,
    ) -> watch::Sender<bool> {
        let server = IpcServer::bind(socket).await.unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.run(handler, rx));
        tx
    }

    #[tokio::test]
    async fn test_start_uses_running_daemon() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let _tx = spawn_daemon(&socket, Arc::new(RecordingDaemon::default())).await;

        let process = DaemonProcess::new(&socket, vec![], &fast_config());
        process.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_times_out_when_daemon_never_answers() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let process = DaemonProcess::new(&socket, vec!["true".to_string()], &fast_config());

        let err = process.start().await.unwrap_err();
        assert!(
            matches!(err, DaemonError::MissingRequirements(ref m) if m == "Daemon process failed to activate")
        );
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempdir().unwrap();
        let process = DaemonProcess::new(
            dir.path().join("daemon.sock"),
            vec!["/nonexistent/ic-http-proxy-daemon".to_string()],
            &fast_config(),
        );

        assert!(matches!(process.start().await, Err(DaemonError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_enable_proxy_sends_payload() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let handler = Arc::new(RecordingDaemon::default());
        let _tx = spawn_daemon(&socket, handler.clone()).await;

        let process = DaemonProcess::new(&socket, vec![], &fast_config());
        process.enable_proxy(&payload()).await.unwrap();
        assert!(process.is_proxy_enabled().await.unwrap());

        let received = handler.received.lock().await;
        assert_eq!(received[0].kind, "enable-proxy");
        assert_eq!(received[0].payload::<EnableProxyPayload>().unwrap(), payload());
    }

    #[tokio::test]
    async fn test_enable_proxy_rejection_is_missing_requirements() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let handler = Arc::new(RecordingDaemon {
            reject_enable: true,
            ..Default::default()
        });
        let _tx = spawn_daemon(&socket, handler).await;

        let process = DaemonProcess::new(&socket, vec![], &fast_config());
        let err = process.enable_proxy(&payload()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing requirements: Failed to enable proxy(trust store locked)"
        );
    }

    #[tokio::test]
    async fn test_shutdown_only_after_start() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let handler = Arc::new(RecordingDaemon::default());
        let _tx = spawn_daemon(&socket, handler.clone()).await;

        let process = DaemonProcess::new(&socket, vec![], &fast_config());
        process.shutdown().await;
        assert!(handler.received.lock().await.is_empty());

        process.start().await.unwrap();
        process.shutdown().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let received = handler.received.lock().await;
        let last = received.last().unwrap();
        assert_eq!(last.kind, "disable-proxy");
        assert!(last.skip_wait);
    }

    #[tokio::test]
    async fn test_shutdown_ignores_missing_daemon() {
        let dir = tempdir().unwrap();
        let process = DaemonProcess::new(dir.path().join("gone.sock"), vec![], &fast_config());
        process.started.store(true, Ordering::SeqCst);
        process.shutdown().await;
    }

    #[test]
    fn test_default_daemon_command() {
        let command = default_daemon_command(Some(Path::new("/etc/proxy.toml"))).unwrap();
        let tail: Vec<_> = command.iter().rev().take(3).rev().cloned().collect();
        assert_eq!(tail, vec!["daemon", "--config", "/etc/proxy.toml"]);
    }
}
