//! ic-http-proxy: browse Internet Computer domains through a local
//! certifying gateway.
//!
//! The proxy process classifies each outbound connection. Connections to
//! hosts served by a canister are diverted to a local TLS gateway that
//! presents a certificate issued by a locally trusted root CA and fetches
//! the content through a boundary node. Everything else is tunnelled to its
//! original destination untouched.
//!
//! # Architecture
//!
//! - **Tls**: root CA and per-host certificate issuance, storage and renewal
//! - **Resolver**: hostname to canister mapping (static table, hostname
//!   embedding, DNS TXT), cached and coalesced
//! - **Proxy**: net proxy, IC gateway and PAC server listeners
//! - **Control**: length-prefixed JSON IPC over Unix sockets
//! - **Daemon**: privileged system integration (trust store, proxy settings)
//! - **Orchestrator**: process lifecycle of the proxy and the daemon
//! - **Config**: hierarchical TOML configuration

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod control;
pub mod daemon;
pub mod orchestrator;
pub mod proxy;
pub mod resolver;
pub mod singleflight;
pub mod tls;
