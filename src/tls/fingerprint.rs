//! Strict-roots TLS stack fingerprinting (§4.4).
//!
//! Clients built on a TLS stack that refuses system-trust-store additions
//! (e.g. Android's conscrypt-backed default, or Go's crypto/tls in FIPS-ish
//! configurations) will fail MITM opaquely: the handshake either aborts with
//! a confusing alert or the request silently fails above the TLS layer.
//! Recognising their narrow, modern cipher-suite fingerprint lets the
//! CONNECT handler refuse to intercept instead, closing the connection
//! cleanly so the client falls back to whatever path it already has.

use once_cell::sync::Lazy;
use std::collections::HashSet;

use super::client_hello::ClientHello;

/// The reference strict-roots cipher-suite set: TLS 1.3 suites, the
/// TLS 1.2 ECDHE AEAD suites typical of a modern conservative stack, and the
/// two signaling SCSVs. Kept as a named constant set so it can be tuned
/// without touching the classification logic.
pub static STRICT_ROOTS_CIPHER_SUITES: Lazy<HashSet<u16>> = Lazy::new(|| {
    [
        0x1301, 0x1302, 0x1303, // TLS 1.3
        0xC02B, 0xC02C, 0xCCA9, 0xC02F, 0xC030, 0xCCA8, // TLS 1.2 ECDHE AEAD
        0x00FF, 0x5600, // renegotiation-info SCSV, fallback SCSV
    ]
    .into_iter()
    .collect()
});

/// Returns true iff `hello` is present, has at least one cipher suite, and
/// every cipher suite it offers is a member of [`STRICT_ROOTS_CIPHER_SUITES`].
/// An empty suite list is treated as "not strict-roots" — the safe default
/// is to intercept, not to block.
pub fn is_strict_roots_client(hello: Option<&ClientHello>) -> bool {
    let Some(hello) = hello else {
        return false;
    };
    if hello.cipher_suites.is_empty() {
        return false;
    }
    hello
        .cipher_suites
        .iter()
        .all(|cs| STRICT_ROOTS_CIPHER_SUITES.contains(cs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(suites: &[u16]) -> ClientHello {
        ClientHello {
            cipher_suites: suites.to_vec(),
            server_name: None,
            alpn: Vec::new(),
        }
    }

    #[test]
    fn recognizes_reference_strict_roots_set() {
        let h = hello(&[0x1301, 0x1302, 0x1303, 0xC02B, 0xC02C, 0xCCA9, 0xC02F, 0xC030, 0xCCA8]);
        assert!(is_strict_roots_client(Some(&h)));
    }

    #[test]
    fn any_extra_permissive_suite_flips_verdict_to_false() {
        let h = hello(&[0x1301, 0x1302, 0x1303, 0x009C]);
        assert!(!is_strict_roots_client(Some(&h)));
    }

    #[test]
    fn no_hello_is_not_strict_roots() {
        assert!(!is_strict_roots_client(None));
    }

    #[test]
    fn empty_suite_list_defaults_to_not_blocking() {
        let h = hello(&[]);
        assert!(!is_strict_roots_client(Some(&h)));
    }

    /// Degenerate case noted in the design: a ClientHello offering *only*
    /// signaling SCSVs (no real cipher suite) is classified as strict-roots
    /// by the literal membership rule, even though this never happens with a
    /// real client in practice.
    #[test]
    fn scsv_only_hello_is_classified_strict_roots() {
        let h = hello(&[0x00FF, 0x5600]);
        assert!(is_strict_roots_client(Some(&h)));
    }
}
