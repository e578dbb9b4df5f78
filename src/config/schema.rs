//! Configuration schema definitions.
//!
//! Every section has working defaults, so an empty file (or no file at all)
//! yields a usable configuration. Files are layered with [`Config::merge`]:
//! a value replaces the current one when it differs from the built-in
//! default, and the static domain table is merged by key.

use super::error::ConfigError;
use crate::control::Endpoint;
use crate::resolver::{ResolverOptions, default_static_domains};
use crate::tls::{CertificateIdentity, FactoryOptions};
use ic_principal::Principal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Directory name used under the platform data directory.
pub const APP_DIR_NAME: &str = "ic-http-proxy";

/// Top-level configuration structure.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Certificate authority and host certificate settings.
    #[serde(default)]
    pub certificates: CertificatesConfig,

    /// Listener of the TCP classifier (what browsers use as their proxy).
    #[serde(default = "default_net_server")]
    pub net_server: ServerAddress,

    /// Listener of the TLS-terminating IC gateway.
    #[serde(default = "default_icp_server")]
    pub icp_server: ServerAddress,

    /// Listener of the PAC script server.
    #[serde(default = "default_pac_server")]
    pub pac_server: ServerAddress,

    /// Control socket paths.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// IC domain resolution.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Upstream for IC requests.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Privileged helper process.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            certificates: CertificatesConfig::default(),
            net_server: default_net_server(),
            icp_server: default_icp_server(),
            pac_server: default_pac_server(),
            ipc: IpcConfig::default(),
            resolver: ResolverConfig::default(),
            gateway: GatewayConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars are overridden when the other value is not the default.
    /// The static domain table is merged (later values override).
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.certificates.merge(other.certificates);
        override_if_set(&mut self.net_server, other.net_server, &default_net_server());
        override_if_set(&mut self.icp_server, other.icp_server, &default_icp_server());
        override_if_set(&mut self.pac_server, other.pac_server, &default_pac_server());
        self.ipc.merge(other.ipc);
        self.resolver.merge(other.resolver);
        self.gateway.merge(other.gateway);
        self.daemon.merge(other.daemon);
    }

    /// Directory holding all persistent state.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.general.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join(APP_DIR_NAME))
                .ok_or(ConfigError::NoDataDirectory),
        }
    }

    /// Directory of the certificate store.
    pub fn certificates_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join(&self.certificates.folder))
    }

    /// Settings for the certificate factory.
    pub fn factory_options(&self) -> FactoryOptions {
        let root_ca = &self.certificates.root_ca;
        FactoryOptions {
            identity: CertificateIdentity {
                common_name: root_ca.common_name.clone(),
                organization_name: root_ca.organization_name.clone(),
                organization_unit: root_ca.organization_unit.clone(),
            },
            host_prefix: self.certificates.host_prefix.clone(),
            retries: self.certificates.creation_retries,
        }
    }

    /// Settings for the domain resolver. Fails on invalid canister ids.
    pub fn resolver_options(&self) -> Result<ResolverOptions, ConfigError> {
        let mut static_domains = HashMap::with_capacity(self.resolver.static_domains.len());
        for (host, canister) in &self.resolver.static_domains {
            let principal =
                Principal::from_text(canister).map_err(|e| ConfigError::InvalidValue {
                    field: format!("resolver.static_domains.\"{}\"", host),
                    message: e.to_string(),
                })?;
            static_domains.insert(host.to_ascii_lowercase(), principal);
        }

        Ok(ResolverOptions {
            static_domains,
            cache_ttl: Duration::from_secs(self.resolver.cache_ttl_secs),
            cache_capacity: self.resolver.cache_capacity,
        })
    }
}

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerAddress {
    /// Interface or hostname.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port; 0 picks a free one.
    pub port: u16,
}

impl ServerAddress {
    /// Address on the loopback interface.
    pub fn localhost(port: u16) -> Self {
        Self {
            host: default_host(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<&ServerAddress> for Endpoint {
    fn from(addr: &ServerAddress) -> Self {
        Endpoint {
            host: addr.host.clone(),
            port: addr.port,
        }
    }
}

/// General application settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GeneralConfig {
    /// Data directory; defaults to `<platform data dir>/ic-http-proxy`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Enable the system integration as soon as the proxy is listening.
    #[serde(default)]
    pub auto_enable: bool,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        if other.auto_enable {
            self.auto_enable = true;
        }
    }
}

/// Certificate settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CertificatesConfig {
    /// Store directory, relative to the data directory.
    pub folder: PathBuf,
    /// Prefix of host certificate ids.
    pub host_prefix: String,
    /// Extra attempts after a failed creation.
    pub creation_retries: u32,
    /// Seconds between CA renewal checks.
    pub renew_interval_secs: u64,
    /// Subject of the root authority.
    pub root_ca: RootCaConfig,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("certs"),
            host_prefix: "host".to_string(),
            creation_retries: 2,
            renew_interval_secs: 30 * 60,
            root_ca: RootCaConfig::default(),
        }
    }
}

impl CertificatesConfig {
    fn merge(&mut self, other: CertificatesConfig) {
        let defaults = CertificatesConfig::default();
        override_if_set(&mut self.folder, other.folder, &defaults.folder);
        override_if_set(&mut self.host_prefix, other.host_prefix, &defaults.host_prefix);
        override_if_set(
            &mut self.creation_retries,
            other.creation_retries,
            &defaults.creation_retries,
        );
        override_if_set(
            &mut self.renew_interval_secs,
            other.renew_interval_secs,
            &defaults.renew_interval_secs,
        );
        self.root_ca.merge(other.root_ca);
    }

    /// Interval of the renewal watchdog.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs.max(1))
    }
}

/// Subject of the root authority.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RootCaConfig {
    /// Common name, also used to find the CA in system trust stores.
    pub common_name: String,
    /// Organization name.
    pub organization_name: String,
    /// Organizational unit.
    pub organization_unit: String,
}

impl Default for RootCaConfig {
    fn default() -> Self {
        let identity = CertificateIdentity::default();
        Self {
            common_name: identity.common_name,
            organization_name: identity.organization_name,
            organization_unit: identity.organization_unit,
        }
    }
}

impl RootCaConfig {
    fn merge(&mut self, other: RootCaConfig) {
        let defaults = RootCaConfig::default();
        override_if_set(&mut self.common_name, other.common_name, &defaults.common_name);
        override_if_set(
            &mut self.organization_name,
            other.organization_name,
            &defaults.organization_name,
        );
        override_if_set(
            &mut self.organization_unit,
            other.organization_unit,
            &defaults.organization_unit,
        );
    }
}

/// Unix socket paths of the two control channels.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Socket served by the proxy process.
    pub proxy_socket: PathBuf,
    /// Socket served by the daemon process.
    pub daemon_socket: PathBuf,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            proxy_socket: PathBuf::from("/tmp/ic-http-proxy.sock"),
            daemon_socket: PathBuf::from("/tmp/ic-http-daemon.sock"),
        }
    }
}

impl IpcConfig {
    fn merge(&mut self, other: IpcConfig) {
        let defaults = IpcConfig::default();
        override_if_set(&mut self.proxy_socket, other.proxy_socket, &defaults.proxy_socket);
        override_if_set(&mut self.daemon_socket, other.daemon_socket, &defaults.daemon_socket);
    }
}

/// Domain resolution settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Seconds an answer stays cached.
    pub cache_ttl_secs: u64,
    /// Maximum number of cached hostnames.
    pub cache_capacity: u64,
    /// Timeout of a single DNS query, in milliseconds.
    pub dns_timeout_ms: u64,
    /// DNS attempts per lookup.
    pub dns_attempts: usize,
    /// Hostname to canister id table.
    pub static_domains: HashMap<String, String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 5 * 60,
            cache_capacity: 1000,
            dns_timeout_ms: 5000,
            dns_attempts: 3,
            static_domains: default_static_domains(),
        }
    }
}

impl ResolverConfig {
    fn merge(&mut self, other: ResolverConfig) {
        let defaults = ResolverConfig::default();
        override_if_set(&mut self.cache_ttl_secs, other.cache_ttl_secs, &defaults.cache_ttl_secs);
        override_if_set(&mut self.cache_capacity, other.cache_capacity, &defaults.cache_capacity);
        override_if_set(&mut self.dns_timeout_ms, other.dns_timeout_ms, &defaults.dns_timeout_ms);
        override_if_set(&mut self.dns_attempts, other.dns_attempts, &defaults.dns_attempts);
        self.static_domains.extend(other.static_domains);
    }

    /// Timeout of a single DNS query.
    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }
}

/// Upstream settings for IC requests.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Boundary node domain canisters are reached through.
    pub boundary_domain: String,
    /// Appended to the browser's `User-Agent`.
    pub user_agent: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            boundary_domain: "icp0.io".to_string(),
            user_agent: format!("ic-http-proxy/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl GatewayConfig {
    fn merge(&mut self, other: GatewayConfig) {
        let defaults = GatewayConfig::default();
        override_if_set(&mut self.boundary_domain, other.boundary_domain, &defaults.boundary_domain);
        override_if_set(&mut self.user_agent, other.user_agent, &defaults.user_agent);
    }
}

/// Daemon process settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Upper bound on waiting for a spawned daemon to answer pings.
    pub activation_timeout_ms: u64,
    /// Delay between activation pings.
    pub activation_interval_ms: u64,
    /// Delay between proxy liveness pings.
    pub watch_interval_ms: u64,
    /// Consecutive failed liveness pings tolerated after the first.
    pub watch_retries: u32,
    /// Argv used to spawn the daemon. Empty means this executable with `daemon`.
    pub command: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            activation_timeout_ms: 10_000,
            activation_interval_ms: 250,
            watch_interval_ms: 3000,
            watch_retries: 2,
            command: Vec::new(),
        }
    }
}

impl DaemonConfig {
    fn merge(&mut self, other: DaemonConfig) {
        let defaults = DaemonConfig::default();
        override_if_set(
            &mut self.activation_timeout_ms,
            other.activation_timeout_ms,
            &defaults.activation_timeout_ms,
        );
        override_if_set(
            &mut self.activation_interval_ms,
            other.activation_interval_ms,
            &defaults.activation_interval_ms,
        );
        override_if_set(&mut self.watch_interval_ms, other.watch_interval_ms, &defaults.watch_interval_ms);
        override_if_set(&mut self.watch_retries, other.watch_retries, &defaults.watch_retries);
        if !other.command.is_empty() {
            self.command = other.command;
        }
    }

    /// Upper bound on daemon activation.
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_timeout_ms)
    }

    /// Delay between activation pings.
    pub fn activation_interval(&self) -> Duration {
        Duration::from_millis(self.activation_interval_ms.max(1))
    }

    /// Delay between liveness pings.
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(1))
    }
}

fn override_if_set<T: PartialEq>(slot: &mut T, value: T, default: &T) {
    if value != *default {
        *slot = value;
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_net_server() -> ServerAddress {
    ServerAddress::localhost(4050)
}

fn default_icp_server() -> ServerAddress {
    ServerAddress::localhost(4051)
}

fn default_pac_server() -> ServerAddress {
    ServerAddress::localhost(4049)
}
