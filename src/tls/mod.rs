//! TLS-record-level plumbing: reading and classifying a ClientHello before
//! any TLS library runs, and replaying the raw bytes afterward.

pub mod client_hello;
pub mod fingerprint;
pub mod prefix_conn;

pub use client_hello::{read_client_hello, ClientHello, ClientHelloRecord};
pub use fingerprint::is_strict_roots_client;
pub use prefix_conn::PrefixConn;
