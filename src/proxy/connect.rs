//! CONNECT decision tree: transparent-tunnel-with-replay, selective MITM, or
//! silent close for strict-roots clients (§4.5).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::certcache::{intercepts, strip_port};
use crate::net::Dialer;
use crate::tls::{is_strict_roots_client, read_client_hello};

use super::{mitm, MitmConfig};

/// Run the §4.5 decision tree for one hijacked CONNECT connection.
///
/// `client` must already have had `HTTP/1.1 200 Connection Established\r\n\r\n`
/// written to it by the caller.
pub async fn handle_connect<S>(
    mut client: S,
    host: String,
    port: u16,
    dialer: Arc<dyn Dialer>,
    mitm_config: Option<Arc<MitmConfig>>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let hello = read_client_hello(&mut client).await?;

    if hello.parsed.is_none() {
        return transparent_tunnel(client, hello.raw, &host, port, dialer.as_ref()).await;
    }

    // Case-sensitive after port strip (spec.md:53) — deliberately not
    // `normalize_host`, whose lowercasing is reserved for the CertCache key.
    let stripped = strip_port(&host);
    let should_mitm = mitm_config
        .as_ref()
        .map(|cfg| intercepts(&cfg.intercept_hosts, &stripped))
        .unwrap_or(false);

    if should_mitm {
        let cfg = mitm_config.expect("should_mitm implies mitm_config is Some");
        return mitm::serve(client, hello.raw, host, port, dialer.as_ref(), cfg.as_ref()).await;
    }

    if is_strict_roots_client(hello.parsed.as_ref()) {
        tracing::debug!(%host, "closing strict-roots client without MITM");
        drop(client);
        return Ok(());
    }

    transparent_tunnel(client, hello.raw, &host, port, dialer.as_ref()).await
}

/// §4.5.1: dial upstream, replay the already-consumed ClientHello bytes,
/// then pump both directions until either side closes. Byte-exact — the
/// client must never observe a modified handshake.
async fn transparent_tunnel<S>(
    mut client: S,
    raw_hello: Vec<u8>,
    host: &str,
    port: u16,
    dialer: &dyn Dialer,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut upstream = dialer
        .dial("tcp", host, port)
        .await
        .map_err(|e| anyhow::anyhow!("dialing upstream {host}:{port} for transparent tunnel: {e}"))?;

    if !raw_hello.is_empty() {
        upstream.write_all(&raw_hello).await?;
    }

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let client_to_upstream = tokio::io::copy(&mut client_read, &mut upstream_write);
    let upstream_to_client = tokio::io::copy(&mut upstream_read, &mut client_write);

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                tracing::debug!("client to upstream tunnel ended: {e}");
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                tracing::debug!("upstream to client tunnel ended: {e}");
            }
        }
    }

    Ok(())
}
