//! Privileged helper process and the proxy's handle on it.
//!
//! The proxy never touches the trust store or proxy settings itself. It
//! starts the daemon through [`DaemonProcess`] and sends it `enable-proxy`;
//! the [`DaemonService`] applies the change through a [`Platform`] and keeps
//! pinging the proxy, detaching once the proxy stops answering.

pub mod error;
pub mod platform;
pub mod process;
pub mod service;

pub use error::{DaemonError, DaemonResult};
pub use platform::{Platform, PlatformConfig, PlatformError, create_platform};
pub use process::{DaemonProcess, default_daemon_command};
pub use service::{DaemonOptions, DaemonService, PlatformFactory};
