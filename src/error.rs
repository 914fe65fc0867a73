//! Error taxonomy shared across the proxy core.
//!
//! Call sites that need to branch on the *kind* of failure use [`ProxyError`];
//! everything else propagates through `anyhow::Result` with `.context(...)`,
//! matching the rest of this crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("client rejected MITM leaf for {host}")]
    HandshakeClient { host: String },

    #[error("upstream TLS handshake failed for {host}: {source}")]
    HandshakeUpstream {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("ssh tunnel exited: {target} ({detail})")]
    TunnelExited { target: String, detail: String },

    #[error("proxy health degraded after {consecutive_failures} consecutive checks")]
    HealthDegraded { consecutive_failures: u32 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn tunnel_exited(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::TunnelExited {
            target: target.into(),
            detail: detail.into(),
        }
    }

    pub fn handshake_client(host: impl Into<String>) -> Self {
        Self::HandshakeClient { host: host.into() }
    }

    pub fn handshake_upstream(host: impl Into<String>, source: anyhow::Error) -> Self {
        Self::HandshakeUpstream {
            host: host.into(),
            source,
        }
    }
}
