//! A minimal SOCKS5 (RFC 1928) client dialer: no authentication, `CONNECT`
//! command only, IPv4/IPv6/domain address types (§4.8). This wraps the
//! `ssh -D` SOCKS endpoint the tunnel supervisor opens.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::dialer::Dialer;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const RESERVED: u8 = 0x00;

/// The fixed timeout on the hop from this process to the SOCKS server
/// itself. Timeouts to the *final* destination are the caller's concern
/// (the SOCKS protocol gives no visibility into that leg).
const SOCKS_SERVER_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Socks5Dialer {
    socks_addr: SocketAddr,
}

impl Socks5Dialer {
    pub fn new(socks_addr: SocketAddr) -> Self {
        Self { socks_addr }
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, _network: &str, host: &str, port: u16) -> anyhow::Result<TcpStream> {
        let mut stream = tokio::time::timeout(
            SOCKS_SERVER_DIAL_TIMEOUT,
            TcpStream::connect(self.socks_addr),
        )
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to SOCKS5 server {}", self.socks_addr))?
        .map_err(|e| anyhow::anyhow!("failed to connect to SOCKS5 server {}: {e}", self.socks_addr))?;

        handshake(&mut stream).await?;
        connect(&mut stream, host, port).await?;

        Ok(stream)
    }
}

async fn handshake(stream: &mut TcpStream) -> anyhow::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;

    if reply[0] != SOCKS_VERSION {
        anyhow::bail!("SOCKS5 server spoke unexpected version {}", reply[0]);
    }
    if reply[1] != METHOD_NO_AUTH {
        anyhow::bail!(
            "SOCKS5 server requires an authentication method ({}) this dialer does not support",
            reply[1]
        );
    }
    Ok(())
}

async fn connect(stream: &mut TcpStream, host: &str, port: u16) -> anyhow::Result<()> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, RESERVED];
    encode_address(&mut request, host);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS_VERSION {
        anyhow::bail!("SOCKS5 server spoke unexpected version {} in CONNECT reply", head[0]);
    }
    if head[1] != 0x00 {
        anyhow::bail!("SOCKS5 CONNECT to {host}:{port} failed with reply code {}", head[1]);
    }

    // Drain the bound-address field so the stream is positioned exactly at
    // the start of the proxied data, matching a real client implementation.
    match head[3] {
        ATYP_IPV4 => {
            let mut skip = [0u8; 4 + 2];
            stream.read_exact(&mut skip).await?;
        }
        ATYP_IPV6 => {
            let mut skip = [0u8; 16 + 2];
            stream.read_exact(&mut skip).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut skip = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut skip).await?;
        }
        other => anyhow::bail!("SOCKS5 server returned unsupported address type {other}"),
    }

    Ok(())
}

fn encode_address(request: &mut Vec<u8>, host: &str) {
    if let Ok(ip) = host.parse::<IpAddr>() {
        match ip {
            IpAddr::V4(v4) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&v6.octets());
            }
        }
    } else {
        request.push(ATYP_DOMAIN);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
    }
}
