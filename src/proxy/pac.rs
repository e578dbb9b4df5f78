//! Proxy auto-configuration (PAC) server.
//!
//! Serves the same script for every path; the system proxy settings point
//! browsers at it so HTTP(S) traffic goes through the net proxy, falling back
//! to a direct connection when the proxy is down.

use super::error::ProxyResult;
use super::gateway::full_body;
use crate::config::ServerAddress;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, SERVER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// PAC script routing `http:`/`https:` URLs through `host:port`.
pub fn pac_script(host: &str, port: u16) -> String {
    format!(
        r#"function FindProxyForURL(url, host) {{
  if (url.startsWith("https:") || url.startsWith("http:")) {{
    return "PROXY {host}:{port}; DIRECT";
  }}

  return "DIRECT";
}}"#
    )
}

/// HTTP server for the PAC script.
pub struct PacServer {
    listener: TcpListener,
    script: Arc<String>,
}

impl PacServer {
    /// Bind at `addr`, advertising the net proxy at `proxy`.
    pub async fn bind(addr: &ServerAddress, proxy: &ServerAddress) -> ProxyResult<Self> {
        let listener = TcpListener::bind((addr.host.as_str(), addr.port)).await?;
        info!("PAC server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            script: Arc::new(pac_script(&proxy.host, proxy.port)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown_rx` flips to true.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> ProxyResult<()> {
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let script = self.script.clone();
                            tokio::spawn(async move {
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let script = script.clone();
                                    async move { Ok::<_, Infallible>(pac_response(&req, &script)) }
                                });
                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!("PAC connection ended: {}", e);
                                }
                            });
                        }
                        Err(e) => warn!("Failed to accept PAC connection: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("PAC server shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

fn pac_response(req: &Request<Incoming>, script: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    debug!(path = %req.uri().path(), "Serving PAC script");
    let mut response = Response::new(full_body(script.to_string()));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/plain"));
    response
        .headers_mut()
        .insert(SERVER, hyper::header::HeaderValue::from_static("IC HTTP Proxy"));
    response
}
