//! Client seam for requests bound for the Internet Computer.
//!
//! The gateway hands every decrypted request to an [`IcGatewayClient`]
//! together with the canister that serves its host. The default client
//! forwards it over HTTPS to the canister's boundary node domain, which
//! verifies the response before returning it.

use super::error::{ProxyError, ProxyResult};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{
    CONNECTION, CONTENT_LENGTH, HOST, HeaderValue, IF_NONE_MATCH, TRANSFER_ENCODING,
    UPGRADE,
};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use ic_principal::Principal;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// HTTPS port of boundary nodes.
const BOUNDARY_NODE_PORT: u16 = 443;

/// Executes an HTTP request against a canister.
#[async_trait]
pub trait IcGatewayClient: Send + Sync {
    /// Fetch `request` from `canister`. The body is fully buffered both ways.
    async fn process(&self, canister: Principal, request: Request<Bytes>) -> ProxyResult<Response<Bytes>>;
}

/// [`IcGatewayClient`] that forwards to `https://<canister>.<boundary_domain>`.
pub struct BoundaryNodeClient {
    boundary_domain: String,
    connector: TlsConnector,
}

impl BoundaryNodeClient {
    /// Client for the given boundary node domain, e.g. `icp0.io`.
    pub fn new(boundary_domain: impl Into<String>) -> Self {
        Self {
            boundary_domain: boundary_domain.into(),
            connector: create_tls_connector(),
        }
    }

    /// Host that serves `canister`.
    pub fn canister_host(&self, canister: &Principal) -> String {
        format!("{}.{}", canister.to_text(), self.boundary_domain)
    }
}

#[async_trait]
impl IcGatewayClient for BoundaryNodeClient {
    async fn process(&self, canister: Principal, request: Request<Bytes>) -> ProxyResult<Response<Bytes>> {
        let host = self.canister_host(&canister);
        let upstream = TcpStream::connect((host.as_str(), BOUNDARY_NODE_PORT))
            .await
            .map_err(|e| ProxyError::Upstream {
                addr: format!("{}:{}", host, BOUNDARY_NODE_PORT),
                message: e.to_string(),
            })?;

        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", host)))?;
        let tls = self
            .connector
            .connect(server_name, upstream)
            .await
            .map_err(|e| ProxyError::Tls(format!("Upstream TLS handshake failed: {}", e)))?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Boundary node connection ended: {}", e);
            }
        });

        let request = prepare_request(request, &host)?;
        debug!(canister = %canister, uri = %request.uri(), "Forwarding IC request");

        let response = sender.send_request(request).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();

        Ok(Response::from_parts(parts, body))
    }
}

/// Rewrite a proxied request for the boundary node: origin-form URI,
/// the canister host, no hop-by-hop headers and no conditional cache headers.
fn prepare_request(request: Request<Bytes>, host: &str) -> ProxyResult<Request<Full<Bytes>>> {
    let (mut parts, body) = request.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidHttp(e.to_string()))?;

    for name in [CONNECTION, TRANSFER_ENCODING, UPGRADE] {
        parts.headers.remove(name);
    }
    parts.headers.remove(IF_NONE_MATCH);
    parts.headers.insert(
        HOST,
        HeaderValue::from_str(host).map_err(|e| ProxyError::InvalidHttp(e.to_string()))?,
    );
    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    Ok(Request::from_parts(parts, Full::new(body)))
}

/// Create a TLS connector trusting the system root certificates.
fn create_tls_connector() -> TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }
    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        warn!("No system root certificates found, IC requests will fail verification");
    } else {
        debug!("Loaded {} root certificates", root_store.len());
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canister_host() {
        let client = BoundaryNodeClient::new("icp0.io");
        let canister = Principal::from_text("qoctq-giaaa-aaaaa-aaaea-cai").unwrap();
        assert_eq!(client.canister_host(&canister), "qoctq-giaaa-aaaaa-aaaea-cai.icp0.io");
    }

    #[test]
    fn test_prepare_request() {
        let request = Request::builder()
            .method("POST")
            .uri("https://nns.ic0.app/api/v2?x=1")
            .header(HOST, "nns.ic0.app")
            .header(CONNECTION, "keep-alive")
            .header(TRANSFER_ENCODING, "chunked")
            .header(IF_NONE_MATCH, "\"etag\"")
            .header("x-custom", "kept")
            .body(Bytes::from_static(b"payload"))
            .unwrap();

        let prepared = prepare_request(request, "qoctq-giaaa-aaaaa-aaaea-cai.icp0.io").unwrap();
        assert_eq!(prepared.uri(), "/api/v2?x=1");
        assert_eq!(prepared.headers()[HOST], "qoctq-giaaa-aaaaa-aaaea-cai.icp0.io");
        assert_eq!(prepared.headers()[CONTENT_LENGTH], "7");
        assert_eq!(prepared.headers()["x-custom"], "kept");
        assert!(!prepared.headers().contains_key(CONNECTION));
        assert!(!prepared.headers().contains_key(TRANSFER_ENCODING));
        assert!(!prepared.headers().contains_key(IF_NONE_MATCH));
    }
}
