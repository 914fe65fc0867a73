//! Local proxy core for a sandboxed coding agent: a CONNECT proxy that
//! selectively intercepts TLS, a supervised `ssh -D` tunnel it can dial
//! through, and the run supervision that keeps the two in lockstep with the
//! agent process they front for.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         run supervisor                           │
//! │  spawns agent with HTTP(S)_PROXY set, polls /_codex_proxy/health  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                      stack orchestrator                          │
//! │   picks ports, starts tunnel, waits for SOCKS readiness,          │
//! │   builds the dialer + proxy, owns ordered shutdown                │
//! ├───────────────────────┬──────────────────────────────────────────┤
//! │   ssh tunnel (tunnel)  │              proxy (proxy)              │
//! │   supervised child      │  CONNECT decision tree, MITM engine,    │
//! │   process, Done() signal│  absolute-form passthrough              │
//! ├───────────────────────┴──────────────────────────────────────────┤
//! │   net (SOCKS5 dialer)  │  tls (ClientHello, fingerprint, replay)  │
//! │   ca / certcache (MITM leaf issuance)                             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod ca;
pub mod certcache;
pub mod config;
pub mod error;
pub mod net;
pub mod orchestrator;
pub mod proxy;
pub mod run_supervisor;
pub mod tls;
pub mod tunnel;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
