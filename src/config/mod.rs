//! Configuration system for ic-http-proxy.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/ic-http-proxy/config.toml`
//! 3. User config: `~/.config/ic-http-proxy/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Missing system and user files are skipped. A file passed with `--config`
//! must exist.
//!
//! ```toml
//! [net_server]
//! port = 4050
//!
//! [resolver.static_domains]
//! "nns.ic0.app" = "qoctq-giaaa-aaaaa-aaaea-cai"
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    APP_DIR_NAME, CertificatesConfig, Config, DaemonConfig, GatewayConfig, GeneralConfig,
    IpcConfig, ResolverConfig, RootCaConfig, ServerAddress,
};
