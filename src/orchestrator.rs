//! Stack orchestrator: wires a supervised SSH tunnel to a local HTTP proxy
//! dialing through it, as one unit with a single ordered shutdown (§4.10).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::ca::CertificateAuthority;
use crate::certcache::CertCache;
use crate::error::ProxyError;
use crate::net::{Dialer, Socks5Dialer};
use crate::proxy::{MitmConfig, ProxyServer, ProxyServerHandle};
use crate::tunnel::{SshTunnel, TunnelSpec, TunnelState};

/// Default bound on the SOCKS-readiness wait (§5: "Stack readiness wait:
/// default 10 s, preempted by tunnel exit").
pub const DEFAULT_SOCKS_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to bring up one tunnel+proxy stack.
pub struct StackOptions {
    pub host: String,
    pub ssh_port: u16,
    pub user: String,
    pub identity_file: Option<String>,
    pub extra_ssh_args: Vec<String>,
    /// Hostnames eligible for TLS interception. Empty means CloudGate is
    /// disabled entirely — the CONNECT handler only ever transparently
    /// tunnels or blocks strict-roots clients.
    pub intercept_hosts: HashSet<String>,
    /// Directory the MITM CA is loaded from or generated into. Irrelevant
    /// when `intercept_hosts` is empty.
    pub ca_dir: PathBuf,
    /// Bound on waiting for the SOCKS port to come up, preempted by tunnel
    /// exit. Defaults to [`DEFAULT_SOCKS_READY_TIMEOUT`].
    pub socks_ready_timeout: Duration,
    /// Explicit SOCKS port instead of picking a free ephemeral one.
    pub socks_port: Option<u16>,
    /// Explicit local proxy port instead of picking a free ephemeral one.
    pub http_port: Option<u16>,
}

impl StackOptions {
    pub fn new(host: impl Into<String>, ssh_port: u16, user: impl Into<String>, ca_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            ssh_port,
            user: user.into(),
            identity_file: None,
            extra_ssh_args: Vec::new(),
            intercept_hosts: HashSet::new(),
            ca_dir: ca_dir.into(),
            socks_ready_timeout: DEFAULT_SOCKS_READY_TIMEOUT,
            socks_port: None,
            http_port: None,
        }
    }

    pub fn with_ports(mut self, socks_port: Option<u16>, http_port: Option<u16>) -> Self {
        self.socks_port = socks_port;
        self.http_port = http_port;
        self
    }
}

/// A running tunnel+proxy stack. `close` must be called to shut the stack
/// down in the right order (proxy before tunnel); dropping it without
/// calling `close` leaks the child `ssh` process.
pub struct RunningStack {
    pub http_addr: SocketAddr,
    pub socks_port: u16,
    tunnel: SshTunnel,
    proxy_handle: Option<ProxyServerHandle>,
}

impl RunningStack {
    /// Pick ports, start the tunnel, wait for it to come up, then start the
    /// local proxy dialing through it.
    pub async fn start(options: StackOptions) -> anyhow::Result<Self> {
        let socks_port = match options.socks_port {
            Some(p) => p,
            None => pick_free_port().await?,
        };
        let http_port = match options.http_port {
            Some(p) => p,
            None => pick_free_port().await?,
        };

        let mut spec = TunnelSpec::new(options.host.clone(), options.ssh_port, options.user.clone(), socks_port)
            .with_extra_args(options.extra_ssh_args);
        if let Some(identity_file) = options.identity_file {
            spec = spec.with_identity_file(identity_file);
        }

        let mut tunnel = SshTunnel::new(spec)?;
        tunnel.start().await?;

        let socks_addr: SocketAddr = format!("127.0.0.1:{socks_port}").parse().expect("loopback address always parses");
        if let Err(e) = wait_for_socks_ready(&tunnel, socks_addr, options.socks_ready_timeout).await {
            let _ = tunnel.stop().await;
            return Err(e);
        }

        let dialer: Arc<dyn Dialer> = Arc::new(Socks5Dialer::new(socks_addr));

        let mitm = if options.intercept_hosts.is_empty() {
            None
        } else {
            Some(Arc::new(build_mitm_config(&options.ca_dir, options.intercept_hosts)?))
        };

        let instance_id = uuid::Uuid::new_v4().to_string();
        let server = ProxyServer::new(dialer, mitm, instance_id);
        let http_addr: SocketAddr = format!("127.0.0.1:{http_port}").parse().expect("loopback address always parses");
        let proxy_handle = match server.start(http_addr).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = tunnel.stop().await;
                return Err(e);
            }
        };

        Ok(Self {
            http_addr: proxy_handle.addr,
            socks_port,
            tunnel,
            proxy_handle: Some(proxy_handle),
        })
    }

    /// Shut the proxy down first, then the tunnel. Idempotent: a second
    /// call is a no-op for the proxy (already taken) and delegates to the
    /// tunnel supervisor's own idempotent `stop`.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        if let Some(handle) = self.proxy_handle.take() {
            handle.close().await;
        }
        self.tunnel.stop().await
    }

    pub fn tunnel_state(&self) -> TunnelState {
        self.tunnel.state()
    }
}

async fn pick_free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

async fn wait_for_socks_ready(tunnel: &SshTunnel, socks_addr: SocketAddr, timeout: Duration) -> anyhow::Result<()> {
    let mut done_rx = tunnel.subscribe_done();
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        if *done_rx.borrow() {
            return Err(ProxyError::tunnel_exited(
                tunnel.target(),
                format!("tunnel exited before {socks_addr} became ready"),
            )
            .into());
        }

        tokio::select! {
            _ = poll.tick() => {
                if TcpStream::connect(socks_addr).await.is_ok() {
                    return Ok(());
                }
            }
            _ = done_rx.changed() => {}
            _ = &mut deadline => {
                return Err(anyhow::anyhow!(
                    "timed out after {timeout:?} waiting for {socks_addr} to accept connections"
                ));
            }
        }
    }
}

fn build_mitm_config(ca_dir: &std::path::Path, intercept_hosts: HashSet<String>) -> anyhow::Result<MitmConfig> {
    let ca = Arc::new(CertificateAuthority::ensure(ca_dir)?);
    let cert_cache = Arc::new(CertCache::new(ca));

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let upstream_tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );

    Ok(MitmConfig {
        intercept_hosts,
        cert_cache,
        upstream_tls_config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readiness_wait_reports_tunnel_exit_with_target_address() {
        let spec = TunnelSpec::new("example.com", 22, "codex", 41999);
        let mut tunnel = SshTunnel::new(spec).unwrap();

        // Stand in for a tunnel whose ssh process exits immediately: start
        // a real child that exits right away, then let the waiter task
        // observe that exit, without ever opening the SOCKS port.
        tunnel.start_with_command_for_test("false").await.unwrap();

        let socks_addr: SocketAddr = "127.0.0.1:41999".parse().unwrap();
        let err = wait_for_socks_ready(&tunnel, socks_addr, Duration::from_millis(500))
            .await
            .expect_err("ssh exiting immediately must fail the readiness wait");
        let message = err.to_string();
        assert!(message.contains("ssh tunnel exited"), "{message}");
        assert!(message.contains("example.com"), "{message}");
    }
}
