//! The `Dial(network, addr)` contract every upstream connection goes
//! through, whether that's a direct TCP dial or a hop through a SOCKS5
//! tunnel. Both the CONNECT handler's transparent tunnel and the MITM
//! engine's upstream leg dial through a `Dialer`.

use async_trait::async_trait;
use tokio::net::TcpStream;

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `host:port`. `network` is currently always `"tcp"`; kept as a
    /// parameter to match the contract's shape rather than because any
    /// other transport is supported today.
    async fn dial(&self, network: &str, host: &str, port: u16) -> anyhow::Result<TcpStream>;
}

/// Dials the real network directly, bypassing any tunnel.
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, _network: &str, host: &str, port: u16) -> anyhow::Result<TcpStream> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| anyhow::anyhow!("direct dial to {host}:{port} failed: {e}"))?;
        Ok(stream)
    }
}
