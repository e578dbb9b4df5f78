//! Network listeners of the proxy process.
//!
//! # Architecture
//!
//! ```text
//!                 ┌─────────────────┐   IC + CONNECT   ┌──────────────────┐
//!   browser ────> │    NetProxy     │ ───────────────> │    IcGateway     │ ──> IcGatewayClient
//!                 │ (TCP classifier)│                  │ (TLS, SNI certs) │
//!                 └───────┬─────────┘                  └──────────────────┘
//!                         │ everything else
//!                         ▼
//!                  original destination
//!
//!   browser ────> PacServer (FindProxyForURL pointing at NetProxy)
//! ```

pub mod error;
pub mod gateway;
pub mod ic_client;
pub mod net;
pub mod pac;

pub use error::{ProxyError, ProxyResult};
pub use gateway::IcGateway;
pub use ic_client::{BoundaryNodeClient, IcGatewayClient};
pub use net::{ConnectionInfo, NetProxy, classify};
pub use pac::{PacServer, pac_script};
