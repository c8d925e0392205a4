//! A thin demo client: TCP + TLS dialing, wired to the engine and its
//! per-origin cache. No retries, no connection pooling policy beyond what
//! [`ConnectionCache`] already provides, no auth — just enough to drive
//! one request end to end.

use crate::cache::ConnectionCache;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::request::{Method, Request, RequestContext};
use crate::response::Response;
use log::trace;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::{client::TlsStream, TlsConnector};
use url::Url;

type Transport = TlsStream<TcpStream>;

pub struct Client {
    connector: TlsConnector,
    cache: ConnectionCache<Transport>,
    options: Options,
}

impl Client {
    #[must_use]
    pub fn new(options: Options) -> Self {
        Self { connector: TlsConnector::from(Arc::new(default_tls_config())), cache: ConnectionCache::new(), options }
    }

    /// Issue a GET against `url`, dialing and/or reusing a cached
    /// connection to its origin.
    pub async fn get(&self, url: &Url) -> Result<Response> {
        let request = build_request(Method::Get, url)?;
        self.send(request).await
    }

    pub async fn send(&self, request: Request) -> Result<Response> {
        let host = request.host.clone();
        let port = request.port.unwrap_or(if request.scheme == "http" { 80 } else { 443 });
        trace!("{} {}://{}:{}{}", request.method, request.scheme, host, port, request.path);

        let connection = self.dial_and_cache(&host, port).await?;
        let ctx = RequestContext::new();
        let response = connection.send_request(request, &ctx, None).await;
        trace!("{host}:{port} elapsed={:?}", ctx.elapsed());
        response
    }

    async fn dial_and_cache(&self, host: &str, port: u16) -> Result<Arc<crate::connection::Connection<Transport>>> {
        let tcp = TcpStream::connect((host, port)).await?;
        let server_name = ServerName::try_from(host).map_err(|_| Error::InvalidRequest(format!("invalid DNS name: {host}")))?;
        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|err| Error::Network(format!("TLS handshake failed: {err}")))?;
        self.cache.get_or_create(host, port, tls, self.options.clone()).await
    }

    /// Dispose every cached connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cache.dispose().await;
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

fn default_tls_config() -> ClientConfig {
    let mut root_store = RootCertStore::empty();
    root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
    }));
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];
    config
}

fn build_request(method: Method, url: &Url) -> Result<Request> {
    let host = url.host_str().ok_or_else(|| Error::InvalidRequest("URL has no host".into()))?;
    let path = match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    };
    let mut request = Request::new(method, url.scheme(), host, path);
    request.is_ipv6 = matches!(url.host(), Some(url::Host::Ipv6(_)));
    if let Some(port) = url.port() {
        request = request.with_port(port);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_carries_query_string() {
        let url = Url::parse("https://example.com/search?q=rust").unwrap();
        let request = build_request(Method::Get, &url).unwrap();
        assert_eq!(request.path, "/search?q=rust");
        assert_eq!(request.authority(), "example.com");
    }
}
