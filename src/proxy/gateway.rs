//! TLS-terminating gateway for Internet Computer traffic.
//!
//! The net proxy splices CONNECT tunnels for IC hosts into this listener.
//! The certificate is chosen from the ClientHello's SNI before the handshake
//! proceeds, issuing a host certificate on first use. Decrypted requests are
//! resolved to their canister and handed to an [`IcGatewayClient`].
//!
//! # Critical ALPN Note
//!
//! We **must** force HTTP/1.1 via ALPN; the request handler only speaks
//! HTTP/1.1.

use super::error::{ProxyError, ProxyResult};
use super::ic_client::IcGatewayClient;
use crate::config::ServerAddress;
use crate::resolver::DomainResolver;
use crate::tls::ActiveCertificates;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderValue, SERVER, USER_AGENT};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

/// `Server` header on every gateway response.
pub const SERVER_NAME: &str = "IC HTTP Proxy";

/// Request header browsers send when fetching a service worker script.
const SERVICE_WORKER: &str = "service-worker";

/// Served in place of a gateway-injected service worker so the browser drops it.
pub const SERVICE_WORKER_UNINSTALL_SCRIPT: &str = r#"
// Uninstalling the IC service worker in favor of the proxy.
self.addEventListener('install', () => self.skipWaiting());
self.addEventListener('activate', () => {
  // uninstall itself & reload page
  self.registration
    .unregister()
    .then(function () {
      return self.clients.matchAll();
    })
    .then(function (clients) {
      clients.forEach((client) => {
        client.navigate(client.url);
      });
    });
});
"#;

/// Shared state of the request handlers.
struct GatewayContext {
    resolver: Arc<DomainResolver>,
    client: Arc<dyn IcGatewayClient>,
    user_agent: String,
}

/// The TLS gateway listener.
pub struct IcGateway {
    listener: TcpListener,
    certificates: Arc<ActiveCertificates>,
    context: Arc<GatewayContext>,
}

impl IcGateway {
    /// Bind at `addr`.
    pub async fn bind(
        addr: &ServerAddress,
        certificates: Arc<ActiveCertificates>,
        resolver: Arc<DomainResolver>,
        client: Arc<dyn IcGatewayClient>,
        user_agent: impl Into<String>,
    ) -> ProxyResult<Self> {
        let listener = TcpListener::bind((addr.host.as_str(), addr.port)).await?;
        info!("IC gateway listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            certificates,
            context: Arc::new(GatewayContext {
                resolver,
                client,
                user_agent: user_agent.into(),
            }),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown_rx` flips to true, then drop live connections.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> ProxyResult<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let certificates = self.certificates.clone();
                            let context = self.context.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, certificates, context).await {
                                    if e.is_disconnect() {
                                        debug!("Gateway connection ended: {}", e);
                                    } else {
                                        warn!("Gateway connection error: {}", e);
                                    }
                                }
                            });
                        }
                        Err(e) => warn!("Failed to accept gateway connection: {}", e),
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(live = connections.len(), "IC gateway shutting down");
        connections.shutdown().await;
        Ok(())
    }
}

/// Always presents one certificate; chosen per connection from the SNI.
#[derive(Debug)]
struct FixedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

fn server_config(certified_key: Arc<CertifiedKey>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCertResolver(certified_key)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

async fn handle_connection(
    stream: TcpStream,
    certificates: Arc<ActiveCertificates>,
    context: Arc<GatewayContext>,
) -> ProxyResult<()> {
    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
        .await
        .map_err(|e| ProxyError::Tls(format!("Client hello failed: {}", e)))?;

    let server_name = start.client_hello().server_name().map(str::to_owned);
    debug!(sni = ?server_name, "TLS client hello");

    let certificate = certificates.certificate_for(server_name.as_deref()).await?;
    let tls = start
        .into_stream(server_config(certificate.certified_key()?))
        .await
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

    let service = service_fn(move |req: Request<Incoming>| {
        let context = context.clone();
        let server_name = server_name.clone();
        async move { Ok::<_, Infallible>(handle_request(req, &context, server_name.as_deref()).await) }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service)
        .await
        .map_err(ProxyError::from)
}

async fn handle_request(
    req: Request<Incoming>,
    context: &GatewayContext,
    server_name: Option<&str>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    match process_request(req, context, server_name).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Failed to handle internet computer request: {}", e);
            error_response(&e)
        }
    }
}

async fn process_request(
    req: Request<Incoming>,
    context: &GatewayContext,
    server_name: Option<&str>,
) -> ProxyResult<Response<BoxBody<Bytes, hyper::Error>>> {
    let host = request_host(&req, server_name).ok_or(ProxyError::MissingHost)?;
    let canister = context
        .resolver
        .lookup_ic_domain(&host)
        .await?
        .ok_or_else(|| ProxyError::CanisterNotFound(host.clone()))?;

    let (mut parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    if let Some(agent) = parts.headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        let agent = format!("{} {}", agent, context.user_agent);
        if let Ok(value) = HeaderValue::from_str(&agent) {
            parts.headers.insert(USER_AGENT, value);
        }
    }
    let service_worker_request = parts.headers.contains_key(SERVICE_WORKER);

    debug!(host = %host, canister = %canister, path = %parts.uri.path(), "IC request");
    let response = context
        .client
        .process(canister, Request::from_parts(parts, body))
        .await?;

    let response = if service_worker_request && !is_on_chain_service_worker(&response) {
        debug!(host = %host, "Replacing gateway service worker");
        service_worker_uninstall_response()
    } else {
        response
    };

    Ok(finalize(response))
}

/// Host of a decrypted request: `Host` header, then the absolute URI, then SNI.
fn request_host<B>(req: &Request<B>, server_name: Option<&str>) -> Option<String> {
    let header_host = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(strip_port);

    header_host
        .or_else(|| req.uri().host())
        .or(server_name)
        .filter(|host| !host.is_empty())
        .map(|host| host.to_ascii_lowercase())
}

fn strip_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split_once(']').map(|(host, _)| host).unwrap_or(rest);
    }
    authority
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority)
}

/// A successful JavaScript response that does not unregister itself.
fn is_on_chain_service_worker(response: &Response<Bytes>) -> bool {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();

    response.status().is_success()
        && matches!(
            content_type,
            "text/javascript" | "application/javascript" | "application/x-javascript"
        )
        && !String::from_utf8_lossy(response.body()).contains("registration.unregister()")
}

fn service_worker_uninstall_response() -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(SERVICE_WORKER_UNINSTALL_SCRIPT.as_bytes()));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/javascript"));
    response
}

/// Attach the gateway's own headers to a buffered IC response.
fn finalize(response: Response<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (mut parts, body) = response.into_parts();
    parts.headers.remove(hyper::header::TRANSFER_ENCODING);
    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    parts.headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    parts.headers.insert(CONNECTION, HeaderValue::from_static("close"));

    Response::from_parts(parts, bytes_body(body))
}

/// `500` describing why the request could not be served.
fn error_response(err: &ProxyError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!("Proxy failed to handle internet computer request {}", err);
    let length = body.len();

    let mut response = Response::new(full_body(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Create a response body with content.
pub(crate) fn full_body(content: String) -> BoxBody<Bytes, hyper::Error> {
    bytes_body(Bytes::from(content))
}

fn bytes_body(content: Bytes) -> BoxBody<Bytes, hyper::Error> {
    Full::new(content)
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{ResolverOptions, ResolverResult, TxtResolver};
    use crate::tls::{CertificateFactory, CertificateStore, FactoryOptions};
    use async_trait::async_trait;
    use ic_principal::Principal;
    use rustls::ClientConfig;
    use rustls_pki_types::ServerName;
    use tempfile::tempdir;
    use tokio_rustls::TlsConnector;

    struct NoTxt;

    #[async_trait]
    impl TxtResolver for NoTxt {
        async fn first_txt(&self, _name: &str) -> ResolverResult<Option<String>> {
            Ok(None)
        }
    }

    /// Answers with the canister id and the forwarded user agent.
    struct EchoClient;

    #[async_trait]
    impl IcGatewayClient for EchoClient {
        async fn process(&self, canister: Principal, request: Request<Bytes>) -> ProxyResult<Response<Bytes>> {
            let agent = request
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string();
            let body = format!("{} {}", canister.to_text(), agent);
            let mut response = Response::new(Bytes::from(body));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            Ok(response)
        }
    }

    async fn start_gateway(dir: &std::path::Path) -> (SocketAddr, Arc<ActiveCertificates>, watch::Sender<bool>) {
        let store = Arc::new(CertificateStore::open(dir).await.unwrap());
        let factory = Arc::new(CertificateFactory::new(store, FactoryOptions::default()));
        let certificates = Arc::new(ActiveCertificates::bootstrap(factory).await.unwrap());
        let resolver = Arc::new(DomainResolver::new(Arc::new(NoTxt), ResolverOptions::default()));

        let addr = ServerAddress {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let gateway = IcGateway::bind(&addr, certificates.clone(), resolver, Arc::new(EchoClient), "test-agent/1.0")
            .await
            .unwrap();
        let local = gateway.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(gateway.run(shutdown_rx));
        (local, certificates, shutdown_tx)
    }

    fn connector(ca_pem: &str) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    async fn get(addr: SocketAddr, ca_pem: &str, host: &str) -> Response<Bytes> {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let tls = connector(ca_pem)
            .connect(ServerName::try_from(host.to_string()).unwrap(), tcp)
            .await
            .unwrap();
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
            .await
            .unwrap();
        tokio::spawn(connection);

        let request = Request::builder()
            .uri("/index.html")
            .header(HOST, host)
            .header(USER_AGENT, "Browser/1")
            .body(http_body_util::Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        let (parts, body) = response.into_parts();
        Response::from_parts(parts, body.collect().await.unwrap().to_bytes())
    }

    #[tokio::test]
    async fn test_serves_ic_request() {
        let dir = tempdir().unwrap();
        let (addr, certificates, _shutdown_tx) = start_gateway(dir.path()).await;

        let response = get(addr, certificates.ca().pem(), "nns.ic0.app").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[SERVER], SERVER_NAME);
        assert_eq!(response.headers()[CONNECTION], "close");
        assert_eq!(
            response.body().as_ref(),
            b"qoctq-giaaa-aaaaa-aaaea-cai Browser/1 test-agent/1.0"
        );
        assert_eq!(
            response.headers()[CONTENT_LENGTH],
            response.body().len().to_string().as_str()
        );
    }

    #[tokio::test]
    async fn test_unknown_host_is_500() {
        let dir = tempdir().unwrap();
        let (addr, certificates, _shutdown_tx) = start_gateway(dir.path()).await;

        let response = get(addr, certificates.ca().pem(), "www.example.com").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(
            response.body().as_ref(),
            b"Proxy failed to handle internet computer request Canister not found for www.example.com"
        );
    }

    #[test]
    fn test_request_host() {
        let req = Request::builder()
            .uri("/")
            .header(HOST, "NNS.ic0.app:443")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req, None).as_deref(), Some("nns.ic0.app"));

        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(request_host(&req, Some("oc.app")).as_deref(), Some("oc.app"));
        assert_eq!(request_host(&req, None), None);
    }

    #[test]
    fn test_service_worker_detection() {
        let mut on_chain = Response::new(Bytes::from_static(b"self.addEventListener('fetch', f);"));
        on_chain
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/javascript"));
        assert!(is_on_chain_service_worker(&on_chain));

        let mut uninstaller = Response::new(Bytes::from_static(b"self.registration.unregister()"));
        uninstaller
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/javascript"));
        assert!(!is_on_chain_service_worker(&uninstaller));

        let html = Response::new(Bytes::from_static(b"<html></html>"));
        assert!(!is_on_chain_service_worker(&html));
    }

    #[test]
    fn test_finalize_sets_gateway_headers() {
        let mut response = Response::new(Bytes::from_static(b"hello"));
        response
            .headers_mut()
            .insert(hyper::header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let response = finalize(response);
        assert_eq!(response.headers()[CONTENT_LENGTH], "5");
        assert_eq!(response.headers()[SERVER], SERVER_NAME);
        assert!(!response.headers().contains_key(hyper::header::TRANSFER_ENCODING));
    }
}
