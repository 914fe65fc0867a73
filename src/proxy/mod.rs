//! Local CONNECT proxy: hostname-gated transparent tunneling plus selective
//! TLS interception (§4.5–§4.7).

pub mod connect;
pub mod mitm;
pub mod server;

use std::collections::HashSet;
use std::sync::Arc;

use rustls::ClientConfig;

use crate::certcache::CertCache;

/// Parameters for the TLS interception path. Shared by the CONNECT handler,
/// which decides whether to take this path, and the MITM engine, which
/// implements it.
pub struct MitmConfig {
    /// Hostnames (post-`normalize_host`) eligible for interception.
    pub intercept_hosts: HashSet<String>,
    pub cert_cache: Arc<CertCache>,
    /// TLS client config used for the upstream leg, rooted in the system's
    /// webpki trust store — never the intercepting CA.
    pub upstream_tls_config: Arc<ClientConfig>,
}

pub use server::{ProxyServer, ProxyServerHandle};
