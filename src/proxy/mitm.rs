//! Selective TLS interception: terminate the client's handshake with a
//! locally-signed leaf, open a second TLS connection to the real upstream,
//! and serve HTTP/1.1 in between with a small canned-response table (§4.6).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, OnceCell};
use tokio_rustls::TlsConnector;

use crate::certcache::normalize_host;
use crate::error::ProxyError;
use crate::net::Dialer;
use crate::tls::PrefixConn;

use super::MitmConfig;

/// 30 s bound on how long the hijacked connection is allowed to finish its
/// current in-flight request after it would otherwise have been accepted
/// and immediately closed by a single-shot listener.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Paths this engine answers directly instead of forwarding upstream.
const CANNED_RESPONSES: &[&str] = &["/api/codex/config/requirements", "/wham/config/requirements"];

fn boxed_body<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// Run §4.6 end to end for one hijacked CONNECT connection.
pub async fn serve<S>(
    client: S,
    raw_hello: Vec<u8>,
    host: String,
    port: u16,
    dialer: &dyn Dialer,
    config: &MitmConfig,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let normalized = normalize_host(&host);
    let host_cert = config.cert_cache.get_cert(&normalized).await?;

    let prefixed = PrefixConn::new(raw_hello, client);

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(host_cert.chain.clone(), host_cert.key.clone_key())
        .map_err(|e| anyhow::anyhow!("building MITM server TLS config for {host}: {e}"))?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    let client_tls = match acceptor.accept(prefixed).await {
        Ok(stream) => stream,
        Err(e) => {
            let rejection = ProxyError::handshake_client(host.clone());
            tracing::debug!(%host, "{rejection}: {e}");
            return Ok(());
        }
    };

    let upstream = LazyUpstream::new(host.clone(), port, dialer, config.upstream_tls_config.clone());
    serve_over(client_tls, upstream).await
}

/// The upstream HTTP/1.1 connection, dialed and handshaken on first use
/// rather than up front: a client that only ever asks for canned-response
/// paths must never cause the real upstream to be contacted (§8 S4).
struct LazyUpstream<'a> {
    host: String,
    port: u16,
    dialer: &'a dyn Dialer,
    tls_config: Arc<rustls::ClientConfig>,
    sender: OnceCell<Arc<Mutex<SendRequest<Incoming>>>>,
}

impl<'a> LazyUpstream<'a> {
    fn new(host: String, port: u16, dialer: &'a dyn Dialer, tls_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            host,
            port,
            dialer,
            tls_config,
            sender: OnceCell::new(),
        }
    }

    async fn sender(&self) -> anyhow::Result<Arc<Mutex<SendRequest<Incoming>>>> {
        let sender = self
            .sender
            .get_or_try_init(|| async {
                let tcp = self
                    .dialer
                    .dial("tcp", &self.host, self.port)
                    .await
                    .map_err(|e| anyhow::anyhow!("dialing MITM upstream {}:{}: {e}", self.host, self.port))?;
                let server_name = ServerName::try_from(self.host.clone())
                    .map_err(|_| anyhow::anyhow!("invalid upstream server name {:?}", self.host))?;
                let connector = TlsConnector::from(self.tls_config.clone());
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| ProxyError::handshake_upstream(self.host.clone(), e.into()))?;
                let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
                    .await
                    .map_err(|e| anyhow::anyhow!("upstream HTTP/1.1 handshake to {} failed: {e}", self.host))?;
                let host = self.host.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::debug!("MITM upstream connection for {host} ended: {e}");
                    }
                });
                Ok::<_, anyhow::Error>(Arc::new(Mutex::new(sender)))
            })
            .await?;
        Ok(sender.clone())
    }
}

async fn serve_over<C>(client_tls: C, upstream: LazyUpstream<'_>) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(client_tls);
    let service = service_fn(move |req: Request<Incoming>| {
        let upstream = &upstream;
        async move { Ok::<_, hyper::Error>(handle_request(req, upstream).await) }
    });

    let serving = server_http1::Builder::new().serve_connection(io, service);
    match tokio::time::timeout(SHUTDOWN_GRACE, serving).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("MITM client connection ended: {e}"),
        Err(_) => tracing::warn!("MITM connection exceeded the 30s shutdown grace period"),
    }

    Ok(())
}

async fn handle_request(req: Request<Incoming>, upstream: &LazyUpstream<'_>) -> Response<BoxBody<Bytes, hyper::Error>> {
    if CANNED_RESPONSES.contains(&req.uri().path()) {
        return Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(boxed_body(r#"{"contents":null}"#))
            .expect("static canned response is well-formed");
    }

    let sender = match upstream.sender().await {
        Ok(sender) => sender,
        Err(e) => {
            tracing::debug!("MITM upstream connect failed: {e}");
            return Response::builder()
                .status(502)
                .body(boxed_body("upstream connect failed"))
                .expect("static error response is well-formed");
        }
    };

    let mut sender = sender.lock().await;
    match sender.send_request(req).await {
        Ok(resp) => resp.map(|body| body.boxed()),
        Err(e) => {
            tracing::debug!("MITM upstream request failed: {e}");
            Response::builder()
                .status(502)
                .body(boxed_body("upstream request failed"))
                .expect("static error response is well-formed")
        }
    }
}
