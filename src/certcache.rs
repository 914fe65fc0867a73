//! Per-host leaf certificate factory and cache (§4.2).
//!
//! Concurrent lookups for the same host must serialize on generation but
//! must not block lookups for other, already-cached hosts. We use a
//! `dashmap`-sharded map of `OnceCell`-style slots: the first caller for a
//! host installs an empty in-flight slot and signs the leaf; later callers
//! for the same host await the same slot instead of re-signing.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use time::{Duration, OffsetDateTime};
use tokio::sync::Notify;

use crate::ca::CertificateAuthority;
use crate::error::ProxyError;

/// A leaf certificate signed by the proxy's CA for a single DNS name.
/// Never written to disk; lives only in this process's memory.
pub struct HostCert {
    pub host: String,
    /// `[leaf, CA]`, ready to hand to a TLS server config.
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub dns_names: Vec<String>,
}

enum Slot {
    Pending(Arc<Notify>),
    Ready(Arc<HostCert>),
}

pub struct CertCache {
    ca: Arc<CertificateAuthority>,
    slots: DashMap<String, Slot>,
}

impl CertCache {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            ca,
            slots: DashMap::new(),
        }
    }

    /// Return the leaf certificate for `host`, generating it on first use.
    /// All concurrent callers for the same host receive the same `Arc`.
    pub async fn get_cert(&self, host: &str) -> anyhow::Result<Arc<HostCert>> {
        let key = host.to_ascii_lowercase();

        loop {
            // Fast path: already cached.
            if let Some(entry) = self.slots.get(&key) {
                match &*entry {
                    Slot::Ready(cert) => return Ok(cert.clone()),
                    Slot::Pending(notify) => {
                        let notify = notify.clone();
                        drop(entry);
                        notify.notified().await;
                        continue;
                    }
                }
            }

            // Nobody is generating yet: try to claim the slot ourselves.
            let notify = Arc::new(Notify::new());
            let claimed = match self.slots.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(Slot::Pending(notify.clone()));
                    true
                }
                dashmap::mapref::entry::Entry::Occupied(_) => false,
            };

            if !claimed {
                // Lost the race; loop back and wait on whoever claimed it.
                continue;
            }

            let result = self.issue_leaf(&key);
            match result {
                Ok(cert) => {
                    let cert = Arc::new(cert);
                    self.slots.insert(key.clone(), Slot::Ready(cert.clone()));
                    notify.notify_waiters();
                    return Ok(cert);
                }
                Err(e) => {
                    // Do not cache failures; let a later caller retry.
                    self.slots.remove(&key);
                    notify.notify_waiters();
                    return Err(e);
                }
            }
        }
    }

    fn issue_leaf(&self, host: &str) -> anyhow::Result<HostCert> {
        let mut params = CertificateParams::default();

        if let Ok(ip) = IpAddr::from_str(host) {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            params.subject_alt_names = vec![SanType::DnsName(
                Ia5String::try_from(host)
                    .map_err(|_| ProxyError::internal(format!("invalid hostname {host:?}")))?,
            )];
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::hours(24)).unwrap_or(now);

        let key_pair = KeyPair::generate().context("failed to generate leaf key")?;
        let cert = params
            .signed_by(&key_pair, self.ca.certificate(), self.ca.key_pair())
            .context("failed to sign leaf certificate")?;

        let chain = vec![cert.der().clone(), self.ca.der().clone()];
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        Ok(HostCert {
            host: host.to_string(),
            chain,
            key,
            dns_names: vec![host.to_string()],
        })
    }
}

/// Strip an optional `:port` suffix and lowercase, matching the cache key
/// convention the CertCache uses (case-insensitive: certificates are issued
/// per lowercased DNS name, so two differently-cased requests for the same
/// host must hit the same leaf).
pub fn normalize_host(host_port: &str) -> String {
    strip_port(host_port).to_ascii_lowercase()
}

/// Strip an optional `:port` suffix, preserving case. The intercept set is
/// matched case-sensitively after port strip, unlike the CertCache key.
pub fn strip_port(host_port: &str) -> String {
    let host = host_port.rsplit_once(':').map(|(h, _)| h).unwrap_or(host_port);
    host.trim_start_matches('[').trim_end_matches(']').to_string()
}

pub fn intercepts(set: &HashSet<String>, host: &str) -> bool {
    set.contains(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn cache(dir: &Path) -> CertCache {
        let ca = CertificateAuthority::ensure(dir).unwrap();
        CertCache::new(Arc::new(ca))
    }

    #[tokio::test]
    async fn leaf_covers_requested_host() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        let cert = cache.get_cert("example.com").await.unwrap();
        assert_eq!(cert.dns_names, vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn different_hosts_yield_different_objects() {
        let dir = tempdir().unwrap();
        let cache = cache(dir.path());
        let a = cache.get_cert("a.example.com").await.unwrap();
        let b = cache.get_cert("b.example.com").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn concurrent_lookups_single_flight_to_one_object() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(cache(dir.path()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_cert("shared.example.com").await.unwrap() }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        let first = &results[0];
        for cert in &results[1..] {
            assert!(Arc::ptr_eq(first, cert));
        }
    }

    #[test]
    fn normalize_host_strips_port_and_brackets() {
        assert_eq!(normalize_host("Example.com:443"), "example.com");
        assert_eq!(normalize_host("[::1]:8080"), "::1");
    }
}
