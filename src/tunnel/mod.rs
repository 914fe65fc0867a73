//! Supervised `ssh -D` tunnel (§4.9).

pub mod spec;
pub mod supervisor;

pub use spec::TunnelSpec;
pub use supervisor::{SshTunnel, TunnelState};
