//! End-to-end coverage of the MITM engine through a real TLS handshake on
//! both legs: a client trusting the intercepting CA, and (for the
//! passthrough case) a fake upstream the dialer is wired to instead of the
//! real network.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use codex_proxy_core::ca::CertificateAuthority;
use codex_proxy_core::certcache::CertCache;
use codex_proxy_core::net::Dialer;
use codex_proxy_core::proxy::connect::handle_connect;
use codex_proxy_core::proxy::MitmConfig;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, KeyPair, SanType};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tempfile::tempdir;
use tokio::io::duplex;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Self-signed cert for `host`, trusted directly as its own root (no CA
/// indirection needed for a throwaway fake-upstream server in a test).
fn self_signed_cert(host: &str) -> (rcgen::Certificate, KeyPair) {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::DnsName(Ia5String::try_from(host).unwrap())];
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert, key)
}

fn client_config_trusting(ca_der: &rustls::pki_types::CertificateDer<'static>) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca_der.clone()).unwrap();
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

fn mitm_config(intercept_hosts: HashSet<String>, upstream_tls_config: Arc<rustls::ClientConfig>) -> (Arc<MitmConfig>, rustls::pki_types::CertificateDer<'static>) {
    let dir = tempdir().unwrap();
    let ca = Arc::new(CertificateAuthority::ensure(dir.path()).unwrap());
    let ca_der = ca.der().clone();
    let cert_cache = Arc::new(CertCache::new(ca));
    (
        Arc::new(MitmConfig {
            intercept_hosts,
            cert_cache,
            upstream_tls_config,
        }),
        ca_der,
    )
}

struct PanicIfDialed;

#[async_trait]
impl Dialer for PanicIfDialed {
    async fn dial(&self, _network: &str, _host: &str, _port: u16) -> anyhow::Result<TcpStream> {
        panic!("canned-response path must never dial the real upstream");
    }
}

struct FixedAddrDialer {
    addr: SocketAddr,
}

#[async_trait]
impl Dialer for FixedAddrDialer {
    async fn dial(&self, _network: &str, _host: &str, _port: u16) -> anyhow::Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }
}

#[tokio::test]
async fn canned_path_never_dials_upstream() {
    let upstream_roots = rustls::RootCertStore::empty();
    let upstream_tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(upstream_roots)
            .with_no_client_auth(),
    );
    let (config, ca_der) = mitm_config(
        ["chatgpt.com".to_string()].into_iter().collect(),
        upstream_tls_config,
    );

    let (server_side, client_side) = duplex(16 * 1024);
    let dialer: Arc<dyn Dialer> = Arc::new(PanicIfDialed);

    let connect_task = tokio::spawn(handle_connect(
        server_side,
        "chatgpt.com".to_string(),
        443,
        dialer,
        Some(config),
    ));

    let client_tls_config = client_config_trusting(&ca_der);
    let connector = TlsConnector::from(client_tls_config);
    let server_name = ServerName::try_from("chatgpt.com").unwrap();
    let tls = connector.connect(server_name, client_side).await.unwrap();

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = Request::builder()
        .method("GET")
        .uri("/api/codex/config/requirements")
        .header("host", "chatgpt.com")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"contents":null}"#);

    drop(sender);
    let _ = connect_task.await;
}

#[tokio::test]
async fn non_canned_path_reaches_mocked_upstream_unchanged() {
    let (upstream_cert, upstream_key) = self_signed_cert("chatgpt.com");
    let upstream_der = upstream_cert.der().clone();
    let upstream_chain = vec![upstream_der.clone()];
    let upstream_key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(upstream_key.serialize_der()));

    let upstream_server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(upstream_chain, upstream_key_der)
        .unwrap();
    let upstream_acceptor = TlsAcceptor::from(Arc::new(upstream_server_config));

    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (sock, _) = upstream_listener.accept().await.unwrap();
        let tls = upstream_acceptor.accept(sock).await.unwrap();
        let service = hyper::service::service_fn(|_req: Request<Incoming>| async {
            Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(b"upstream-ok"))))
        });
        let _ = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(tls), service)
            .await;
    });

    let upstream_tls_config = client_config_trusting(&upstream_der);
    let (config, ca_der) = mitm_config(
        ["chatgpt.com".to_string()].into_iter().collect(),
        upstream_tls_config,
    );

    let (server_side, client_side) = duplex(16 * 1024);
    let dialer: Arc<dyn Dialer> = Arc::new(FixedAddrDialer { addr: upstream_addr });

    let connect_task = tokio::spawn(handle_connect(
        server_side,
        "chatgpt.com".to_string(),
        443,
        dialer,
        Some(config),
    ));

    let client_tls_config = client_config_trusting(&ca_der);
    let connector = TlsConnector::from(client_tls_config);
    let server_name = ServerName::try_from("chatgpt.com").unwrap();
    let tls = connector.connect(server_name, client_side).await.unwrap();

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = Request::builder()
        .method("GET")
        .uri("/api/other/endpoint")
        .header("host", "chatgpt.com")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"upstream-ok");

    drop(sender);
    let _ = connect_task.await;
}
