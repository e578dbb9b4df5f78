//! TCP classifier and passthrough proxy.
//!
//! Browsers reach this listener through the system proxy settings. Each
//! connection is classified once, on its first chunk:
//!
//! ```text
//!   CONNECT ic-host:443 ──> 200 Connection established ──> splice to TLS gateway
//!   GET / (Host: ic-host) ─> 301 https://ic-host
//!   anything else ────────> splice to the original destination
//! ```
//!
//! Live connections are tracked so shutdown can drop them all at once
//! instead of waiting for long-lived tunnels to drain.

use super::error::{ProxyError, ProxyResult};
use crate::config::ServerAddress;
use crate::resolver::DomainResolver;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default port for CONNECT targets without an explicit port.
pub const DEFAULT_SECURE_PORT: u16 = 443;

/// Default port for plain HTTP targets without an explicit port.
pub const DEFAULT_INSECURE_PORT: u16 = 80;

/// Largest first chunk considered for classification.
const FIRST_CHUNK_SIZE: usize = 16 * 1024;

/// Reply to a CONNECT request once the origin is reachable.
pub const CONNECT_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection established\r\nProxy-agent: Internet Computer Proxy\r\n\r\n";

/// Body of the synthesized 404 for unresolvable destinations.
pub const NOT_FOUND_BODY: &str = "Error: ENOTFOUND - The requested resource could not be found.";

/// Body of the synthesized 301 for plain-HTTP IC requests.
pub const MOVED_PERMANENTLY_BODY: &str = "Page moved permanently";

/// Target of a proxied connection, parsed from its first chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Destination host, without brackets for IPv6 literals.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// The client opened a CONNECT tunnel.
    pub secure: bool,
}

/// Parse the destination out of the first chunk of a proxied connection.
///
/// A `CONNECT host:port` request line marks the connection secure. Anything
/// else must carry a `Host:` header.
pub fn classify(chunk: &[u8]) -> ProxyResult<ConnectionInfo> {
    let text = String::from_utf8_lossy(chunk);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    if parts
        .next()
        .is_some_and(|method| method.eq_ignore_ascii_case("CONNECT"))
    {
        let authority = parts.next().ok_or(ProxyError::MissingHost)?;
        let (host, port) = parse_host_port(authority, DEFAULT_SECURE_PORT)?;
        return Ok(ConnectionInfo {
            host,
            port,
            secure: true,
        });
    }

    let authority = lines
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("host")
                .then(|| value.trim())
        })
        .ok_or(ProxyError::MissingHost)?;
    let (host, port) = parse_host_port(authority, DEFAULT_INSECURE_PORT)?;

    Ok(ConnectionInfo {
        host,
        port,
        secure: false,
    })
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
///
/// Examples:
/// - `example.com:8443` -> ("example.com", 8443)
/// - `example.com` -> ("example.com", default_port)
/// - `[::1]:443` -> ("::1", 443)
pub fn parse_host_port(authority: &str, default_port: u16) -> ProxyResult<(String, u16)> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or(ProxyError::MissingHost)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port),
            None if tail.is_empty() => None,
            None => return Err(ProxyError::InvalidPort(tail.to_string())),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(ProxyError::MissingHost);
    }

    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidPort(port.to_string()))?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}

/// `301` pointing a plain-HTTP IC request at its HTTPS origin.
pub fn moved_permanently_response(host: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 301 Moved Permanently\r\n\
         Server: IC HTTP Proxy\r\n\
         Content-Type: text/plain\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\
         Location: https://{}\r\n\
         \r\n\
         {}",
        MOVED_PERMANENTLY_BODY.len(),
        host,
        MOVED_PERMANENTLY_BODY
    )
    .into_bytes()
}

/// `404` for destinations whose name does not resolve.
pub fn not_found_response() -> Vec<u8> {
    format!(
        "HTTP/1.1 404 Not Found\r\n\
         Server: IC HTTP Proxy\r\n\
         Content-Type: text/plain\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        NOT_FOUND_BODY.len(),
        NOT_FOUND_BODY
    )
    .into_bytes()
}

/// The TCP classifier listener.
pub struct NetProxy {
    listener: TcpListener,
    resolver: Arc<DomainResolver>,
    gateway: Arc<ServerAddress>,
}

impl NetProxy {
    /// Bind at `addr`, routing IC traffic to `gateway`.
    pub async fn bind(
        addr: &ServerAddress,
        resolver: Arc<DomainResolver>,
        gateway: ServerAddress,
    ) -> ProxyResult<Self> {
        let listener = TcpListener::bind((addr.host.as_str(), addr.port)).await?;
        info!("Net proxy listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            resolver,
            gateway: Arc::new(gateway),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown_rx` flips to true, then drop every
    /// live connection.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> ProxyResult<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Accepted connection");
                            let resolver = self.resolver.clone();
                            let gateway = self.gateway.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, resolver, gateway).await {
                                    if e.is_disconnect() {
                                        debug!("Connection ended: {}", e);
                                    } else {
                                        warn!("Connection error: {}", e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = result
                        && e.is_panic() {
                            warn!("Connection task panicked: {}", e);
                        }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(live = connections.len(), "Net proxy shutting down");
        connections.shutdown().await;
        Ok(())
    }
}

async fn handle_connection(
    mut client: TcpStream,
    resolver: Arc<DomainResolver>,
    gateway: Arc<ServerAddress>,
) -> ProxyResult<()> {
    let mut buf = vec![0u8; FIRST_CHUNK_SIZE];
    let read = client.read(&mut buf).await?;
    if read == 0 {
        return Ok(());
    }
    let first_chunk = &buf[..read];

    let connection = classify(first_chunk)?;
    let ic_request = is_ic_request(&resolver, &connection.host).await;

    if ic_request && !connection.secure {
        debug!(host = %connection.host, "Redirecting plain HTTP IC request");
        client
            .write_all(&moved_permanently_response(&connection.host))
            .await?;
        client.shutdown().await?;
        return Ok(());
    }

    let (origin_host, origin_port) = if ic_request {
        info!("Proxying web3 request for {}:{}", connection.host, connection.port);
        (gateway.host.as_str(), gateway.port)
    } else {
        info!("Proxying web2 request for {}:{}", connection.host, connection.port);
        (connection.host.as_str(), connection.port)
    };

    let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((origin_host, origin_port)).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            debug!(host = %origin_host, "Origin lookup failed: {}", e);
            Vec::new()
        }
    };
    if addrs.is_empty() {
        client.write_all(&not_found_response()).await?;
        client.shutdown().await?;
        return Ok(());
    }

    let mut origin = TcpStream::connect(&addrs[..])
        .await
        .map_err(|e| ProxyError::Upstream {
            addr: format!("{}:{}", origin_host, origin_port),
            message: e.to_string(),
        })?;

    if connection.secure {
        client.write_all(CONNECT_ESTABLISHED).await?;
    } else {
        origin.write_all(first_chunk).await?;
    }

    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut origin).await?;
    debug!(
        host = %connection.host,
        sent,
        received,
        "Connection closed"
    );
    Ok(())
}

/// Resolver failures fail open to passthrough.
async fn is_ic_request(resolver: &DomainResolver, host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return false;
    }
    match resolver.lookup_ic_domain(host).await {
        Ok(canister) => canister.is_some(),
        Err(e) => {
            warn!(host = %host, "Failed to query dns record: {}", e);
            false
        }
    }
}
