//! Proxy and daemon process lifecycle.
//!
//! [`ProxyServers`] owns everything the proxy process runs: the active
//! certificates, the domain resolver, the four listeners (control socket,
//! IC gateway, net proxy, PAC server) and the handle on the privileged
//! daemon. [`run_proxy`] and [`run_daemon`] are the process entry points.

use anyhow::{Context, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ServerAddress};
use crate::control::{
    EnableProxyPayload, Endpoint, HandlerError, IpcRequest, IpcServer, MessageHandler,
    ProxyMessage, RunningStatus, StartedStatus,
};
use crate::daemon::{
    DaemonError, DaemonOptions, DaemonProcess, DaemonService, default_daemon_command,
};
use crate::proxy::{BoundaryNodeClient, IcGateway, IcGatewayClient, NetProxy, PacServer};
use crate::resolver::{DomainResolver, SystemTxtResolver};
use crate::singleflight::SingleFlight;
use crate::tls::{ActiveCertificates, CertificateFactory, CertificateResult, CertificateStore};

/// Upper bound on waiting for listeners to wind down after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Result of an enable attempt, shared between coalesced callers.
pub type EnableResult = Result<(), Arc<DaemonError>>;

/// Addresses the listeners actually bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenAddresses {
    /// Net proxy (what browsers use as their proxy).
    pub net: SocketAddr,
    /// TLS gateway.
    pub icp: SocketAddr,
    /// PAC server.
    pub pac: SocketAddr,
}

/// Tasks spawned by [`ProxyServers::start`].
pub struct RunningServers {
    addresses: ListenAddresses,
    tasks: JoinSet<()>,
}

impl RunningServers {
    /// Bound addresses.
    pub fn addresses(&self) -> ListenAddresses {
        self.addresses
    }

    /// Wait for every listener and the renewal watchdog to stop.
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                error!("Server task panicked: {}", e);
            }
        }
    }
}

/// The proxy process.
pub struct ProxyServers {
    config: Config,
    certificates: Arc<ActiveCertificates>,
    resolver: Arc<DomainResolver>,
    client: Arc<dyn IcGatewayClient>,
    daemon: DaemonProcess,
    enabled: AtomicBool,
    shutting_down: AtomicBool,
    inflight: SingleFlight<(ProxyMessage, bool), EnableResult>,
    addresses: OnceLock<ListenAddresses>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyServers {
    /// Prepare requirements: the certificate store, the root CA and the
    /// `localhost` certificate, the resolver and the gateway client.
    pub async fn create(config: Config, daemon_command: Vec<String>) -> Result<Arc<Self>> {
        let certs_dir = config
            .certificates_dir()
            .context("Failed to locate the data directory")?;
        let store = CertificateStore::open(&certs_dir)
            .await
            .with_context(|| format!("Failed to open certificate store at {:?}", certs_dir))?;
        let factory = CertificateFactory::new(Arc::new(store), config.factory_options());
        let certificates = ActiveCertificates::bootstrap(Arc::new(factory))
            .await
            .context("Failed to prepare certificates")?;

        let txt = SystemTxtResolver::new(config.resolver.dns_timeout(), config.resolver.dns_attempts);
        let resolver = DomainResolver::new(Arc::new(txt), config.resolver_options()?);
        let client = BoundaryNodeClient::new(config.gateway.boundary_domain.clone());
        let daemon = DaemonProcess::new(&config.ipc.daemon_socket, daemon_command, &config.daemon);

        Ok(Self::from_parts(
            config,
            Arc::new(certificates),
            Arc::new(resolver),
            Arc::new(client),
            daemon,
        ))
    }

    /// Assemble from already built components.
    pub fn from_parts(
        config: Config,
        certificates: Arc<ActiveCertificates>,
        resolver: Arc<DomainResolver>,
        client: Arc<dyn IcGatewayClient>,
        daemon: DaemonProcess,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            certificates,
            resolver,
            client,
            daemon,
            enabled: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            inflight: SingleFlight::new(),
            addresses: OnceLock::new(),
            shutdown_tx,
        })
    }

    /// Bind every listener and start serving.
    ///
    /// The control socket is bound first so it is ready before anything can
    /// ask to enable the proxy.
    pub async fn start(self: &Arc<Self>) -> Result<RunningServers> {
        let ipc = IpcServer::bind(&self.config.ipc.proxy_socket)
            .await
            .context("Failed to bind the proxy control socket")?;

        let gateway = IcGateway::bind(
            &self.config.icp_server,
            self.certificates.clone(),
            self.resolver.clone(),
            self.client.clone(),
            self.config.gateway.user_agent.clone(),
        )
        .await
        .context("Failed to bind the IC gateway")?;
        let icp = gateway.local_addr()?;

        let net = NetProxy::bind(
            &self.config.net_server,
            self.resolver.clone(),
            ServerAddress {
                host: self.config.icp_server.host.clone(),
                port: icp.port(),
            },
        )
        .await
        .context("Failed to bind the net proxy")?;
        let net_addr = net.local_addr()?;

        let pac = PacServer::bind(
            &self.config.pac_server,
            &ServerAddress {
                host: self.config.net_server.host.clone(),
                port: net_addr.port(),
            },
        )
        .await
        .context("Failed to bind the PAC server")?;

        let addresses = ListenAddresses {
            net: net_addr,
            icp,
            pac: pac.local_addr()?,
        };
        // A second start on the same instance keeps the first addresses.
        let _ = self.addresses.set(addresses);

        let mut tasks = JoinSet::new();
        let handler = self.clone();
        let rx = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(e) = ipc.run(handler, rx).await {
                error!("Control socket error: {}", e);
            }
        });
        let rx = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(e) = gateway.run(rx).await {
                error!("IC gateway error: {}", e);
            }
        });
        let rx = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(e) = net.run(rx).await {
                error!("Net proxy error: {}", e);
            }
        });
        let rx = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(e) = pac.run(rx).await {
                error!("PAC server error: {}", e);
            }
        });
        tasks.spawn(self.clone().renewal_watchdog());

        info!(
            net = %addresses.net,
            icp = %addresses.icp,
            pac = %addresses.pac,
            "IC HTTP Proxy servers listening"
        );

        Ok(RunningServers { addresses, tasks })
    }

    /// Whether the system integration is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has begun.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// The active certificates.
    pub fn certificates(&self) -> &Arc<ActiveCertificates> {
        &self.certificates
    }

    /// Start the daemon and have it trust the CA and route the system
    /// through the proxy.
    ///
    /// Concurrent calls with the same `force` share one attempt. Without
    /// `force` an already enabled environment is left alone.
    pub async fn enable_secure_environment(&self, force: bool) -> EnableResult {
        self.inflight
            .run((ProxyMessage::Enable, force), || async {
                self.apply_secure_environment(force).await.map_err(Arc::new)
            })
            .await
    }

    async fn apply_secure_environment(&self, force: bool) -> Result<(), DaemonError> {
        if self.is_enabled() && !force {
            return Ok(());
        }
        if self.is_shutting_down() {
            return Err(DaemonError::MissingRequirements(
                "Proxy is shutting down".to_string(),
            ));
        }

        self.daemon.start().await?;
        self.daemon.enable_proxy(&self.enable_payload()).await?;
        self.enabled.store(true, Ordering::SeqCst);
        info!("Secure environment enabled");
        Ok(())
    }

    /// What the daemon needs to attach the proxy to the system.
    pub fn enable_payload(&self) -> EnableProxyPayload {
        let (net_port, pac_port) = match self.addresses.get() {
            Some(addresses) => (addresses.net.port(), addresses.pac.port()),
            None => (self.config.net_server.port, self.config.pac_server.port),
        };

        EnableProxyPayload {
            host: self.config.net_server.host.clone(),
            port: net_port,
            certificate_path: self.certificates.ca_path(),
            common_name: self.config.certificates.root_ca.common_name.clone(),
            pac: Endpoint {
                host: self.config.pac_server.host.clone(),
                port: pac_port,
            },
        }
    }

    /// Renew the root when due, re-applying the system integration if it
    /// was enabled. Returns whether a renewal happened.
    pub async fn check_renewal(&self) -> CertificateResult<bool> {
        if !self.certificates.renew_if_needed().await? {
            return Ok(false);
        }

        if self.is_enabled()
            && let Err(e) = self.enable_secure_environment(true).await
        {
            warn!("Failed to enable proxy with renewed root CA: {}", e);
            self.enabled.store(false, Ordering::SeqCst);
        }
        Ok(true)
    }

    async fn renewal_watchdog(self: Arc<Self>) {
        let interval = self.config.certificates.renew_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => return,
            }

            match self.check_renewal().await {
                Ok(true) => info!("Root CA renewed by watchdog"),
                Ok(false) => debug!("Root CA renewal not needed"),
                Err(e) => warn!("Root CA renewal failed: {}", e),
            }
        }
    }

    /// Disable the system integration (best effort) and stop every
    /// listener. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Proxy is shutting down");
        self.daemon.shutdown().await;
        self.enabled.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
    }
}

#[async_trait::async_trait]
impl MessageHandler for ProxyServers {
    async fn handle(&self, request: IpcRequest) -> Result<Option<Value>, HandlerError> {
        let Some(message) = ProxyMessage::parse(&request.kind) else {
            debug!(kind = %request.kind, "Ignoring unknown proxy message");
            return Ok(None);
        };

        match message {
            ProxyMessage::Ping => Ok(None),
            ProxyMessage::IsRunning => Ok(Some(serde_json::to_value(RunningStatus {
                running: self.is_enabled(),
            })?)),
            ProxyMessage::IsStarted => Ok(Some(serde_json::to_value(StartedStatus {
                is_shutting_down: self.is_shutting_down(),
            })?)),
            ProxyMessage::Stop => {
                self.shutdown().await;
                Ok(None)
            }
            ProxyMessage::Enable => {
                self.enable_secure_environment(false)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(None)
            }
        }
    }
}

/// Run the proxy process until `stop` arrives or the process is interrupted.
pub fn run_proxy(config: Config, config_path: Option<&Path>) -> Result<()> {
    let daemon_command = if config.daemon.command.is_empty() {
        default_daemon_command(config_path).context("Failed to build the daemon command")?
    } else {
        config.daemon.command.clone()
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async move {
        info!("Preparing system requirements");
        let auto_enable = config.general.auto_enable;
        let servers = ProxyServers::create(config, daemon_command).await?;
        let running = match servers.start().await {
            Ok(running) => running,
            Err(e) => {
                servers.shutdown().await;
                return Err(e);
            }
        };

        if auto_enable && let Err(e) = servers.enable_secure_environment(false).await {
            error!("Failed to enable secure environment: {}", e);
        }

        let mut shutdown_rx = servers.shutdown_signal();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                servers.shutdown().await;
            }
            _ = shutdown_rx.wait_for(|stopping| *stopping) => {}
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, running.wait()).await.is_err() {
            warn!("Listeners did not stop within {:?}", SHUTDOWN_GRACE);
        }
        info!("Proxy has exited");
        Ok(())
    })
}

/// Run the privileged daemon until `disable-proxy`, interruption, or the
/// proxy going away.
pub fn run_daemon(config: &Config) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async {
        let server = IpcServer::bind(&config.ipc.daemon_socket)
            .await
            .context("Failed to bind the daemon control socket")?;
        let service = DaemonService::new(DaemonOptions::from_config(config));

        info!("Waiting for tasks");
        let serving = tokio::spawn(service.clone().serve(server));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                service.shutdown();
            }
            _ = service_stopped(&service) => {}
        }

        serving
            .await
            .context("Daemon task failed")?
            .context("Daemon control socket failed")?;
        Ok(())
    })
}

async fn service_stopped(service: &DaemonService) {
    let mut rx = service.shutdown_signal();
    let _ = rx.wait_for(|stopping| *stopping).await;
}
