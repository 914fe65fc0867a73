//! Single loopback listener for the local proxy: a health endpoint, CONNECT
//! hijacking into §4.5, and absolute-form passthrough for plain HTTP (§4.7).

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::net::Dialer;

use super::MitmConfig;

type Body = BoxBody<Bytes, hyper::Error>;

fn empty_body() -> Body {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

fn json_body(value: serde_json::Value) -> Body {
    Full::new(Bytes::from(value.to_string()))
        .map_err(|never| match never {})
        .boxed()
}

/// Dials outbound connections for the reverse-proxy path through whatever
/// [`Dialer`] the stack was built with (direct, or through the SOCKS5
/// tunnel), instead of hyper's own `HttpConnector`.
#[derive(Clone)]
struct DialerConnector {
    dialer: Arc<dyn Dialer>,
}

struct ConnectedStream(TokioIo<TcpStream>);

impl Connection for ConnectedStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for ConnectedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for ConnectedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl tower_service::Service<Uri> for DialerConnector {
    type Response = ConnectedStream;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| anyhow::anyhow!("request URI {uri} has no host to dial"))?
                .to_string();
            let port = uri
                .port_u16()
                .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });
            let stream = dialer.dial("tcp", &host, port).await?;
            Ok(ConnectedStream(TokioIo::new(stream)))
        })
    }
}

struct Shared {
    dialer: Arc<dyn Dialer>,
    mitm: Option<Arc<MitmConfig>>,
    instance_id: String,
    forward_client:
        hyper_util::client::legacy::Client<DialerConnector, Incoming>,
}

/// The local CONNECT/HTTP proxy. `start` may only be called once.
pub struct ProxyServer {
    shared: Arc<Shared>,
    started: std::sync::atomic::AtomicBool,
}

/// A handle to a running [`ProxyServer`]: the address it bound, and a way
/// to request a graceful shutdown.
pub struct ProxyServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    join: tokio::task::JoinHandle<()>,
}

impl ProxyServerHandle {
    /// Request shutdown and wait for the accept loop to exit. Idempotent:
    /// a second call observes the task has already finished and returns.
    pub async fn close(self) {
        self.shutdown.notify_waiters();
        let _ = self.join.await;
    }
}

impl ProxyServer {
    pub fn new(dialer: Arc<dyn Dialer>, mitm: Option<Arc<MitmConfig>>, instance_id: String) -> Self {
        let forward_client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
            .build(DialerConnector { dialer: dialer.clone() });
        Self {
            shared: Arc::new(Shared {
                dialer,
                mitm,
                instance_id,
                forward_client,
            }),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Bind `addr` (typically `127.0.0.1:0`) and start accepting connections.
    /// Returns the bound address and a handle to shut the server down.
    pub async fn start(&self, addr: SocketAddr) -> anyhow::Result<ProxyServerHandle> {
        if self.started.swap(true, std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("ProxyServer::start called more than once");
        }

        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        let shared = self.shared.clone();

        let accept_shutdown = shutdown.clone();
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.notified() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                tracing::debug!(%peer, "accepted proxy connection");
                                let shared = shared.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = serve_connection(stream, shared).await {
                                        tracing::debug!("proxy connection ended: {e}");
                                    }
                                });
                            }
                            Err(e) => tracing::warn!("accept error: {e}"),
                        }
                    }
                }
            }
        });

        Ok(ProxyServerHandle {
            addr: bound_addr,
            shutdown,
            join,
        })
    }
}

async fn serve_connection(stream: TcpStream, shared: Arc<Shared>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let shared = shared.clone();
        async move { Ok::<_, hyper::Error>(route(req, shared).await) }
    });

    server_http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await?;
    Ok(())
}

async fn route(req: Request<Incoming>, shared: Arc<Shared>) -> Response<Body> {
    if req.method() == Method::GET && req.uri().path() == "/_codex_proxy/health" {
        return Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(json_body(serde_json::json!({
                "ok": true,
                "instanceId": shared.instance_id,
            })))
            .expect("static health response is well-formed");
    }

    if req.method() == Method::CONNECT {
        return handle_connect_request(req, shared).await;
    }

    handle_forward(req, shared).await
}

async fn handle_connect_request(req: Request<Incoming>, shared: Arc<Shared>) -> Response<Body> {
    let authority = match req.uri().authority().map(|a| a.to_string()) {
        Some(a) => a,
        None => {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(empty_body())
                .expect("static error response is well-formed");
        }
    };
    let (host, port) = match authority.rsplit_once(':').and_then(|(h, p)| Some((h.to_string(), p.parse::<u16>().ok()?))) {
        Some(pair) => pair,
        None => (authority.clone(), 443),
    };

    let dialer = shared.dialer.clone();
    let mitm = shared.mitm.clone();

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                if let Err(e) = run_hijacked(io, host, port, dialer, mitm).await {
                    tracing::debug!("CONNECT tunnel error: {e}");
                }
            }
            Err(e) => tracing::debug!("CONNECT upgrade failed: {e}"),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .expect("static 200 Connection Established response is well-formed")
}

async fn run_hijacked<S>(
    mut io: S,
    host: String,
    port: u16,
    dialer: Arc<dyn Dialer>,
    mitm: Option<Arc<MitmConfig>>,
) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    use tokio::io::AsyncWriteExt;
    io.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
    super::connect::handle_connect(io, host, port, dialer, mitm).await
}

async fn handle_forward(req: Request<Incoming>, shared: Arc<Shared>) -> Response<Body> {
    let (mut parts, body) = req.into_parts();
    parts.headers.remove("proxy-connection");

    let forwarded = Request::from_parts(parts, body);
    match shared.forward_client.request(forwarded).await {
        Ok(resp) => resp.map(|b| b.boxed()),
        Err(e) => {
            tracing::debug!("forward request failed: {e}");
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(empty_body())
                .expect("static error response is well-formed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::DirectDialer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn health_endpoint_reports_ok_without_forwarding() {
        let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer);
        let server = ProxyServer::new(dialer, None, "test-instance".to_string());
        let handle = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut stream = TcpStream::connect(handle.addr).await.unwrap();
        stream
            .write_all(b"GET /_codex_proxy/health HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.contains("200 OK"));
        assert!(response.contains("\"ok\":true"));
        assert!(response.contains("test-instance"));

        handle.close().await;
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer);
        let server = ProxyServer::new(dialer, None, "test-instance".to_string());
        let _handle = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let err = server.start("127.0.0.1:0".parse().unwrap()).await;
        assert!(err.is_err());
    }
}
