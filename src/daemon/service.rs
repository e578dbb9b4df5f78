//! The privileged daemon: applies system integration on request from the
//! proxy and undoes it when the proxy goes away.

use super::error::DaemonResult;
use super::platform::{Platform, PlatformConfig, PlatformResult, create_platform};
use crate::config::Config;
use crate::control::{
    DaemonMessage, EnableProxyPayload, HandlerError, IpcClient, IpcRequest, IpcServer,
    MessageHandler, ProxyEnabledStatus,
};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Builds the platform for an `enable-proxy` request.
pub type PlatformFactory =
    Arc<dyn Fn(PlatformConfig) -> PlatformResult<Box<dyn Platform>> + Send + Sync>;

/// Daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Control socket of the proxy process, pinged for liveness.
    pub proxy_socket: PathBuf,
    /// Delay between liveness pings.
    pub watch_interval: Duration,
    /// Failed pings tolerated after the first one.
    pub watch_retries: u32,
}

impl DaemonOptions {
    /// Options from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            proxy_socket: config.ipc.proxy_socket.clone(),
            watch_interval: config.daemon.watch_interval(),
            watch_retries: config.daemon.watch_retries,
        }
    }
}

#[derive(Default)]
struct DaemonState {
    platform: Option<Box<dyn Platform>>,
    enabled: bool,
}

/// Message handler and lifecycle of the daemon process.
pub struct DaemonService {
    options: DaemonOptions,
    platforms: PlatformFactory,
    state: Mutex<DaemonState>,
    shutdown_tx: watch::Sender<bool>,
}

impl DaemonService {
    /// Service creating platforms for the running OS.
    pub fn new(options: DaemonOptions) -> Arc<Self> {
        Self::with_platforms(
            options,
            Arc::new(|config| create_platform(std::env::consts::OS, config)),
        )
    }

    /// Service with a custom platform factory.
    pub fn with_platforms(options: DaemonOptions, platforms: PlatformFactory) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            options,
            platforms,
            state: Mutex::new(DaemonState::default()),
            shutdown_tx,
        })
    }

    /// Serve `server` until shutdown, watching the proxy meanwhile.
    pub async fn serve(self: Arc<Self>, server: IpcServer) -> DaemonResult<()> {
        let watch = tokio::spawn(self.clone().watch_proxy());
        let result = server.run(self.clone(), self.shutdown_tx.subscribe()).await;
        watch.abort();
        info!("Daemon exited");
        result.map_err(Into::into)
    }

    /// Stop serving.
    pub fn shutdown(&self) {
        info!("Shutting down daemon");
        self.shutdown_tx.send_replace(true);
    }

    /// Flips to `true` once shutdown has begun.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Whether a platform is currently attached.
    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    async fn enable_proxy(&self, payload: EnableProxyPayload) -> DaemonResult<()> {
        let platform = (self.platforms)(PlatformConfig::from_payload(&payload))?;

        let mut state = self.state.lock().await;
        if let Some(previous) = state.platform.take()
            && state.enabled
        {
            debug!("Detaching previous proxy configuration");
            state.enabled = false;
            if let Err(e) = previous.detach().await {
                warn!("Failed to detach previous proxy configuration: {}", e);
            }
        }

        platform.attach().await?;
        state.platform = Some(platform);
        state.enabled = true;
        info!(host = %payload.host, port = payload.port, "Proxy attached to system");
        Ok(())
    }

    async fn detach(&self) -> DaemonResult<()> {
        let mut state = self.state.lock().await;
        if state.enabled
            && let Some(platform) = &state.platform
        {
            platform.detach().await?;
        }
        state.enabled = false;
        Ok(())
    }

    async fn disable_proxy(&self) -> DaemonResult<()> {
        let result = self.detach().await;
        self.shutdown();
        result
    }

    /// Ping the proxy every interval. Once it misses more than
    /// `watch_retries` pings in a row, detach and exit.
    async fn watch_proxy(self: Arc<Self>) {
        let client = IpcClient::new(&self.options.proxy_socket).with_timeout(self.options.watch_interval);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.options.watch_interval) => {}
                _ = shutdown_rx.changed() => return,
            }

            if client.ping().await {
                failures = 0;
                continue;
            }

            failures += 1;
            if failures <= self.options.watch_retries {
                debug!(failures, "Proxy did not answer ping");
                continue;
            }

            info!("Proxy server not running, removing configuration from system");
            if let Err(e) = self.detach().await {
                warn!("Failed to detach proxy: {}", e);
            }
            self.shutdown();
            return;
        }
    }
}

#[async_trait]
impl MessageHandler for DaemonService {
    async fn handle(&self, request: IpcRequest) -> Result<Option<Value>, HandlerError> {
        let Some(message) = DaemonMessage::parse(&request.kind) else {
            debug!(kind = %request.kind, "Ignoring unknown daemon message");
            return Ok(None);
        };

        match message {
            DaemonMessage::Ping => Ok(None),
            DaemonMessage::EnableProxy => {
                let payload: EnableProxyPayload = request.payload()?;
                self.enable_proxy(payload).await?;
                Ok(None)
            }
            DaemonMessage::DisableProxy => {
                self.disable_proxy().await?;
                Ok(None)
            }
            DaemonMessage::IsProxyEnabled => {
                let status = ProxyEnabledStatus {
                    enabled: self.is_enabled().await,
                };
                Ok(Some(serde_json::to_value(status)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Endpoint, IpcResponse};
    use crate::daemon::platform::PlatformError;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Calls(StdMutex<Vec<&'static str>>);

    impl Calls {
        fn push(&self, call: &'static str) {
            self.0.lock().unwrap().push(call);
        }

        fn list(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    struct FakePlatform {
        calls: Arc<Calls>,
        fail_attach: bool,
    }

    #[async_trait]
    impl Platform for FakePlatform {
        async fn attach(&self) -> PlatformResult<()> {
            self.calls.push("attach");
            if self.fail_attach {
                return Err(PlatformError::NoNetworkService);
            }
            Ok(())
        }

        async fn detach(&self) -> PlatformResult<()> {
            self.calls.push("detach");
            Ok(())
        }

        async fn configure_web_proxy(&self, _enable: bool) -> PlatformResult<()> {
            Ok(())
        }
    }

    fn service(proxy_socket: PathBuf, fail_attach: bool) -> (Arc<DaemonService>, Arc<Calls>) {
        service_with_interval(proxy_socket, fail_attach, Duration::from_millis(20))
    }

    fn service_with_interval(
        proxy_socket: PathBuf,
        fail_attach: bool,
        watch_interval: Duration,
    ) -> (Arc<DaemonService>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let factory_calls = calls.clone();
        let options = DaemonOptions {
            proxy_socket,
            watch_interval,
            watch_retries: 2,
        };
        let service = DaemonService::with_platforms(
            options,
            Arc::new(move |_config| {
                Ok(Box::new(FakePlatform {
                    calls: factory_calls.clone(),
                    fail_attach,
                }) as Box<dyn Platform>)
            }),
        );
        (service, calls)
    }

    fn enable_request() -> IpcRequest {
        let payload = EnableProxyPayload {
            host: "127.0.0.1".to_string(),
            port: 4050,
            certificate_path: PathBuf::from("/tmp/ca.cert"),
            common_name: "Root".to_string(),
            pac: Endpoint {
                host: "127.0.0.1".to_string(),
                port: 4049,
            },
        };
        IpcRequest::with_payload("enable-proxy", &payload).unwrap()
    }

    #[tokio::test]
    async fn test_enable_then_query() {
        let dir = tempdir().unwrap();
        let (service, calls) = service(dir.path().join("proxy.sock"), false);

        service.handle(enable_request()).await.unwrap();
        let data = service.handle(IpcRequest::new("is-proxy-enabled")).await.unwrap();

        assert_eq!(data, Some(serde_json::json!({ "enabled": true })));
        assert_eq!(calls.list(), vec!["attach"]);
    }

    #[tokio::test]
    async fn test_second_enable_detaches_previous_platform() {
        let dir = tempdir().unwrap();
        let (service, calls) = service(dir.path().join("proxy.sock"), false);

        service.handle(enable_request()).await.unwrap();
        service.handle(enable_request()).await.unwrap();

        assert_eq!(calls.list(), vec!["attach", "detach", "attach"]);
        assert!(service.is_enabled().await);
    }

    #[tokio::test]
    async fn test_enable_and_disable_do_not_interleave() {
        let dir = tempdir().unwrap();
        let (service, calls) = service_with_interval(
            dir.path().join("proxy.sock"),
            false,
            Duration::from_secs(60),
        );

        let (enabled, disabled) = tokio::join!(
            service.handle(enable_request()),
            service.handle(IpcRequest::new("disable-proxy"))
        );
        enabled.unwrap();
        disabled.unwrap();

        // Either order leaves a consistent state: disable saw the attach
        // complete, or enable ran after a no-op disable.
        match calls.list().as_slice() {
            ["attach", "detach"] => assert!(!service.is_enabled().await),
            ["attach"] => assert!(service.is_enabled().await),
            other => panic!("unexpected platform calls {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_attach_is_reported() {
        let dir = tempdir().unwrap();
        let (service, _calls) = service(dir.path().join("proxy.sock"), true);

        assert!(service.handle(enable_request()).await.is_err());
        assert!(!service.is_enabled().await);
    }

    #[tokio::test]
    async fn test_invalid_enable_payload() {
        let dir = tempdir().unwrap();
        let (service, calls) = service(dir.path().join("proxy.sock"), false);

        assert!(service.handle(IpcRequest::new("enable-proxy")).await.is_err());
        assert!(calls.list().is_empty());
    }

    #[tokio::test]
    async fn test_disable_detaches_and_stops_server() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let (service, calls) =
            service_with_interval(dir.path().join("proxy.sock"), false, Duration::from_secs(60));
        service.handle(enable_request()).await.unwrap();

        let server = IpcServer::bind(&socket).await.unwrap();
        let serving = tokio::spawn(service.clone().serve(server));

        let client = IpcClient::new(&socket);
        let response: IpcResponse = client
            .send(&IpcRequest::new("disable-proxy").skip_wait(true))
            .await
            .unwrap();
        assert!(response.processed);

        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(calls.list(), vec!["attach", "detach"]);
        assert!(!service.is_enabled().await);
    }

    #[tokio::test]
    async fn test_disable_without_enable_skips_detach() {
        let dir = tempdir().unwrap();
        let (service, calls) = service(dir.path().join("proxy.sock"), false);

        service.handle(IpcRequest::new("disable-proxy")).await.unwrap();
        assert!(calls.list().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_message_is_acknowledged() {
        let dir = tempdir().unwrap();
        let (service, _calls) = service(dir.path().join("proxy.sock"), false);
        assert_eq!(service.handle(IpcRequest::new("reboot")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_exits_when_proxy_disappears() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let (service, calls) = service(dir.path().join("missing-proxy.sock"), false);
        service.handle(enable_request()).await.unwrap();

        let server = IpcServer::bind(&socket).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), service.clone().serve(server))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(calls.list(), vec!["attach", "detach"]);
    }
}
