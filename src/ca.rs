//! CA store: generate-or-load the long-lived self-signed CA used to sign
//! per-host leaf certificates (§4.1).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};

use crate::error::ProxyError;

const CA_CERT_FILE: &str = "mitm-ca.pem";
const CA_KEY_FILE: &str = "mitm-ca-key.pem";

/// A loaded or freshly generated CA keypair, kept in memory for the lifetime
/// of the process. Never rewritten once `EnsureCA` has returned it.
pub struct CertificateAuthority {
    cert: Certificate,
    key: KeyPair,
    der: CertificateDer<'static>,
}

impl CertificateAuthority {
    /// Load the CA from `dir` if both files exist and parse; otherwise
    /// generate and persist a fresh one.
    pub fn ensure(dir: &Path) -> anyhow::Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        // Files unreadable (e.g. permission denied, or simply absent) are
        // treated as missing and regenerated. Files that are readable but
        // fail to *decode* are corrupt user state and must not be silently
        // overwritten.
        let cert_pem = fs::read_to_string(&cert_path).ok();
        let key_pem = fs::read_to_string(&key_path).ok();

        if let (Some(cert_pem), Some(key_pem)) = (cert_pem, key_pem) {
            return Self::from_pem(&cert_pem, &key_pem);
        }

        Self::generate_and_persist(dir, &cert_path, &key_path)
    }

    fn from_pem(cert_pem: &str, key_pem: &str) -> anyhow::Result<Self> {
        let key = KeyPair::from_pem(key_pem).map_err(|e| {
            ProxyError::internal(format!("corrupt-ca: failed to parse CA key PEM: {e}"))
        })?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem).map_err(|e| {
            ProxyError::internal(format!("corrupt-ca: failed to parse CA certificate PEM: {e}"))
        })?;
        let cert = params.self_signed(&key).map_err(|e| {
            ProxyError::internal(format!(
                "corrupt-ca: failed to reconstruct self-signed CA certificate: {e}"
            ))
        })?;
        let der = cert.der().clone();

        Ok(Self { cert, key, der })
    }

    fn generate_and_persist(dir: &Path, cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir).context("failed to create CA storage directory")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                    .context("failed to set CA storage directory permissions")?;
            }
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Codex Proxy MITM CA");
        dn.push(DnType::OrganizationName, "Codex Helper");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365 * 5)).unwrap_or(now);

        let key = KeyPair::generate().context("failed to generate CA key")?;
        let cert = params
            .self_signed(&key)
            .context("failed to self-sign CA certificate")?;

        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();

        fs::write(cert_path, &cert_pem).context("failed to write CA certificate")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(cert_path, fs::Permissions::from_mode(0o644))
                .context("failed to chmod CA certificate")?;
        }
        fs::write(key_path, &key_pem).context("failed to write CA key")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))
                .context("failed to chmod CA key")?;
        }

        let der = cert.der().clone();
        Ok(Self { cert, key, der })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// Serial number of the underlying certificate, used to verify that
    /// repeated `ensure` calls on the same directory return the same CA.
    pub fn serial_number_hex(&self) -> String {
        match x509_parser::parse_x509_certificate(self.der.as_ref()) {
            Ok((_, parsed)) => hex_encode(parsed.raw_serial()),
            Err(_) => String::new(),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

pub fn default_ca_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join(CA_CERT_FILE), dir.join(CA_KEY_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_ca_once_and_reuses_existing_files() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::ensure(dir.path()).expect("initial creation");
        assert!(!ca.cert_pem().is_empty());
        let (cert_path, key_path) = default_ca_paths(dir.path());
        assert!(cert_path.exists());
        assert!(key_path.exists());
    }

    #[test]
    fn ensure_is_idempotent_across_processes() {
        let dir = tempdir().unwrap();
        let first = CertificateAuthority::ensure(dir.path()).unwrap();
        let second = CertificateAuthority::ensure(dir.path()).unwrap();
        assert_eq!(first.serial_number_hex(), second.serial_number_hex());
    }

    #[test]
    fn corrupt_existing_pem_is_a_fatal_error_not_silent_overwrite() {
        let dir = tempdir().unwrap();
        let (cert_path, key_path) = default_ca_paths(dir.path());
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(&cert_path, b"not a cert").unwrap();
        fs::write(&key_path, b"not a key").unwrap();

        let err = CertificateAuthority::ensure(dir.path())
            .expect_err("corrupt existing CA files must not be silently regenerated");
        assert!(err.to_string().contains("corrupt-ca"));
        // Original (corrupt) files are left untouched.
        assert_eq!(fs::read(&cert_path).unwrap(), b"not a cert");
    }
}
