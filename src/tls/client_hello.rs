//! Read a TLS record off a hijacked connection and best-effort parse it as a
//! ClientHello (§4.3), preserving the raw bytes for verbatim replay.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_DEADLINE: Duration = Duration::from_secs(5);
const MAX_RECORD_BODY: usize = 16_384;
const HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const CLIENT_HELLO_TYPE: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;

#[derive(Debug, Default, Clone)]
pub struct ClientHello {
    pub cipher_suites: Vec<u16>,
    pub server_name: Option<String>,
    pub alpn: Vec<String>,
}

/// The raw bytes read from the wire, plus a best-effort parse. `parsed` is
/// `None` whenever the record was not a handshake record, was out of the
/// accepted length range, or failed to parse as a ClientHello — `raw` is
/// always populated and always replayable verbatim.
#[derive(Debug, Clone)]
pub struct ClientHelloRecord {
    pub raw: Vec<u8>,
    pub parsed: Option<ClientHello>,
}

/// Read a single TLS record header (and, if it looks like a ClientHello
/// handshake record, its body) from `conn`, bounded by a 5 second deadline.
pub async fn read_client_hello<S>(conn: &mut S) -> anyhow::Result<ClientHelloRecord>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(READ_DEADLINE, read_client_hello_inner(conn))
        .await
        .map_err(|_| anyhow::anyhow!("timed out reading ClientHello"))?
}

async fn read_client_hello_inner<S>(conn: &mut S) -> anyhow::Result<ClientHelloRecord>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    conn.read_exact(&mut header).await?;

    if header[0] != HANDSHAKE_CONTENT_TYPE {
        return Ok(ClientHelloRecord {
            raw: header.to_vec(),
            parsed: None,
        });
    }

    let body_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if body_len == 0 || body_len > MAX_RECORD_BODY {
        return Ok(ClientHelloRecord {
            raw: header.to_vec(),
            parsed: None,
        });
    }

    let mut body = vec![0u8; body_len];
    conn.read_exact(&mut body)
        .await
        .map_err(|e| anyhow::anyhow!("truncated ClientHello body: {e}"))?;

    let mut raw = Vec::with_capacity(5 + body_len);
    raw.extend_from_slice(&header);
    raw.extend_from_slice(&body);

    let parsed = parse_client_hello(&body);

    Ok(ClientHelloRecord { raw, parsed })
}

/// Best-effort ClientHello parse. Returns `None` on any structural failure
/// in the mandatory fields; a failure inside one extension aborts only that
/// extension, preserving fields already parsed.
fn parse_client_hello(body: &[u8]) -> Option<ClientHello> {
    let mut r = Reader::new(body);

    if r.u8()? != CLIENT_HELLO_TYPE {
        return None;
    }
    let handshake_len = r.u24()?;
    let mut hs = Reader::new(r.take(handshake_len)?);

    hs.skip(34)?; // client_version (2) + random (32)

    let session_id_len = hs.u8()? as usize;
    hs.skip(session_id_len)?;

    let cipher_suites_len = hs.u16()? as usize;
    let mut suites_reader = Reader::new(hs.take(cipher_suites_len)?);
    let mut cipher_suites = Vec::with_capacity(cipher_suites_len / 2);
    while suites_reader.remaining() >= 2 {
        cipher_suites.push(suites_reader.u16()?);
    }

    let compression_len = hs.u8()? as usize;
    hs.skip(compression_len)?;

    let mut server_name = None;
    let mut alpn = Vec::new();

    if hs.remaining() >= 2 {
        if let Some(extensions_len) = hs.u16() {
            if let Some(ext_body) = hs.take(extensions_len as usize) {
                parse_extensions(ext_body, &mut server_name, &mut alpn);
            }
        }
    }

    Some(ClientHello {
        cipher_suites,
        server_name,
        alpn,
    })
}

fn parse_extensions(body: &[u8], server_name: &mut Option<String>, alpn: &mut Vec<String>) {
    let mut r = Reader::new(body);
    while r.remaining() >= 4 {
        let Some(ext_type) = r.u16() else { break };
        let Some(ext_len) = r.u16() else { break };
        let Some(ext_data) = r.take(ext_len as usize) else { break };

        match ext_type {
            EXT_SERVER_NAME => {
                if let Some(name) = parse_server_name(ext_data) {
                    *server_name = Some(name);
                }
            }
            EXT_ALPN => {
                if let Some(protocols) = parse_alpn(ext_data) {
                    *alpn = protocols;
                }
            }
            _ => {}
        }
    }
}

fn parse_server_name(data: &[u8]) -> Option<String> {
    let mut r = Reader::new(data);
    let list_len = r.u16()? as usize;
    let mut list = Reader::new(r.take(list_len)?);
    while list.remaining() >= 3 {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        if name_type == 0x00 {
            return std::str::from_utf8(name).ok().map(str::to_string);
        }
    }
    None
}

fn parse_alpn(data: &[u8]) -> Option<Vec<String>> {
    let mut r = Reader::new(data);
    let list_len = r.u16()? as usize;
    let mut list = Reader::new(r.take(list_len)?);
    let mut protocols = Vec::new();
    while list.remaining() >= 1 {
        let proto_len = list.u8()? as usize;
        let proto = list.take(proto_len)?;
        protocols.push(String::from_utf8_lossy(proto).to_string());
    }
    Some(protocols)
}

/// A tiny bounds-checked cursor over a byte slice, used instead of pulling
/// in a parser-combinator crate for this fixed, small grammar.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3).map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_bytes(cipher_suites: &[u16], sni: Option<&str>, alpn: &[&str]) -> Vec<u8> {
        let mut hs_body = Vec::new();
        hs_body.extend_from_slice(&[3, 3]); // client_version
        hs_body.extend_from_slice(&[0u8; 32]); // random
        hs_body.push(0); // session id len

        hs_body.extend_from_slice(&((cipher_suites.len() * 2) as u16).to_be_bytes());
        for cs in cipher_suites {
            hs_body.extend_from_slice(&cs.to_be_bytes());
        }

        hs_body.push(1); // compression methods len
        hs_body.push(0); // null compression

        let mut extensions = Vec::new();
        if let Some(sni) = sni {
            let mut sni_ext = Vec::new();
            let mut server_name_list = Vec::new();
            server_name_list.push(0u8); // host_name type
            server_name_list.extend_from_slice(&(sni.len() as u16).to_be_bytes());
            server_name_list.extend_from_slice(sni.as_bytes());
            sni_ext.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
            sni_ext.extend_from_slice(&server_name_list);

            extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&sni_ext);
        }
        if !alpn.is_empty() {
            let mut proto_list = Vec::new();
            for p in alpn {
                proto_list.push(p.len() as u8);
                proto_list.extend_from_slice(p.as_bytes());
            }
            let mut alpn_ext = Vec::new();
            alpn_ext.extend_from_slice(&(proto_list.len() as u16).to_be_bytes());
            alpn_ext.extend_from_slice(&proto_list);

            extensions.extend_from_slice(&EXT_ALPN.to_be_bytes());
            extensions.extend_from_slice(&(alpn_ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&alpn_ext);
        }

        hs_body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hs_body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(CLIENT_HELLO_TYPE);
        let len = hs_body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&hs_body);

        let mut record = Vec::new();
        record.push(HANDSHAKE_CONTENT_TYPE);
        record.extend_from_slice(&[3, 1]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[tokio::test]
    async fn parses_cipher_suites_sni_and_alpn() {
        let bytes = client_hello_bytes(
            &[0x1301, 0x1302, 0xC02B],
            Some("chatgpt.com"),
            &["h2", "http/1.1"],
        );
        let mut cursor = std::io::Cursor::new(bytes);
        let record = read_client_hello(&mut cursor).await.unwrap();
        let hello = record.parsed.expect("should parse");
        assert_eq!(hello.cipher_suites, vec![0x1301, 0x1302, 0xC02B]);
        assert_eq!(hello.server_name.as_deref(), Some("chatgpt.com"));
        assert_eq!(hello.alpn, vec!["h2".to_string(), "http/1.1".to_string()]);
        assert!(!record.raw.is_empty());
    }

    #[tokio::test]
    async fn non_handshake_record_is_raw_only() {
        let bytes = vec![0x17, 0x03, 0x01, 0x00, 0x05, 1, 2, 3, 4, 5];
        let mut cursor = std::io::Cursor::new(bytes.clone());
        let record = read_client_hello(&mut cursor).await.unwrap();
        assert!(record.parsed.is_none());
        assert_eq!(record.raw, &bytes[..5]);
    }

    #[tokio::test]
    async fn oversized_body_length_is_raw_only() {
        let mut bytes = vec![HANDSHAKE_CONTENT_TYPE, 3, 1, 0xFF, 0xFF];
        bytes.extend(std::iter::repeat(0u8).take(10));
        let mut cursor = std::io::Cursor::new(bytes.clone());
        let record = read_client_hello(&mut cursor).await.unwrap();
        assert!(record.parsed.is_none());
        assert_eq!(record.raw, &bytes[..5]);
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut bytes = vec![HANDSHAKE_CONTENT_TYPE, 3, 1, 0, 10];
        bytes.extend_from_slice(&[0u8; 3]); // declared 10 bytes, only 3 present
        let mut cursor = std::io::Cursor::new(bytes);
        let result = read_client_hello(&mut cursor).await;
        assert!(result.is_err());
    }
}
