//! Local certificate authority for the HTTPS callback listener.
//!
//! The daemon terminates TLS with a leaf certificate for `localhost` issued by
//! a CA that lives only on this machine. Both pairs are kept as PEM files in
//! one owner-only directory:
//!
//! | File | Contents |
//! |---|---|
//! | `ca.pem` / `ca.key` | self-signed ECDSA P-256 CA, 10 years |
//! | `localhost.pem` / `localhost.key` | ECDSA P-256 leaf, 90 days, SANs `localhost`, `127.0.0.1`, `::1` |
//!
//! Existing material is only trusted after validation; anything that fails
//! is regenerated wholesale.

use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType,
    SerialNumber,
};
use rustls::RootCertStore;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::persist::{self, PRIVATE_FILE_MODE};

pub const CA_CERT_FILE: &str = "ca.pem";
pub const CA_KEY_FILE: &str = "ca.key";
pub const LEAF_CERT_FILE: &str = "localhost.pem";
pub const LEAF_KEY_FILE: &str = "localhost.key";

const CA_COMMON_NAME: &str = "grantkeeper local CA";
const LEAF_COMMON_NAME: &str = "localhost";
const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 90;
const LEAF_RENEW_WINDOW_DAYS: i64 = 14;

/// Server name the leaf is verified for.
const LEAF_SERVER_NAME: &str = "localhost";

/// Error type for certificate operations.
#[derive(Debug, Error)]
pub enum CertError {
    /// Reading or writing certificate material failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Key generation, signing or PEM handling failed.
    #[error("certificate error: {0}")]
    Generate(#[from] rcgen::Error),

    /// Existing material did not pass validation.
    #[error("invalid certificate material: {0}")]
    Invalid(String),
}

impl CertError {
    fn io(path: &Path, source: io::Error) -> Self {
        CertError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// TLS material for the HTTPS listener.
#[derive(Clone)]
pub struct LeafMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    /// Colon-separated uppercase hex of the leaf's public key point.
    pub fingerprint: String,
}

impl std::fmt::Debug for LeafMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafMaterial")
            .field("fingerprint", &self.fingerprint)
            .field("key_pem", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Loaded CA: the signing handle, its key and the on-disk DER.
struct CaMaterial {
    cert: Certificate,
    key: KeyPair,
    der: CertificateDer<'static>,
}

/// Manages the CA and leaf files in one directory.
#[derive(Debug, Clone)]
pub struct CertAuthority {
    dir: PathBuf,
}

impl CertAuthority {
    /// Manage certificate material under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.dir.join(CA_KEY_FILE)
    }

    pub fn leaf_cert_path(&self) -> PathBuf {
        self.dir.join(LEAF_CERT_FILE)
    }

    pub fn leaf_key_path(&self) -> PathBuf {
        self.dir.join(LEAF_KEY_FILE)
    }

    /// Make sure a usable CA exists and return the path of its certificate.
    pub fn ensure_ca(&self) -> Result<PathBuf, CertError> {
        self.load_or_create_ca()?;
        Ok(self.ca_cert_path())
    }

    /// Return a valid leaf, reusing the one on disk when it passes validation.
    pub fn ensure_leaf(&self) -> Result<LeafMaterial, CertError> {
        let ca = self.load_or_create_ca()?;
        let cert_path = self.leaf_cert_path();
        let key_path = self.leaf_key_path();

        match self.load_leaf(&ca) {
            Ok(leaf) => {
                repair_permissions(&[&cert_path, &key_path])?;
                tracing::debug!(path = %cert_path.display(), "Reusing leaf certificate");
                return Ok(leaf);
            }
            Err(e) => {
                tracing::info!(reason = %e, "Issuing a new leaf certificate");
            }
        }

        let not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);
        let leaf = issue_leaf(&ca, not_after)?;
        write_pem(&cert_path, &leaf.cert_pem)?;
        write_pem(&key_path, &leaf.key_pem)?;
        Ok(leaf)
    }

    fn load_or_create_ca(&self) -> Result<CaMaterial, CertError> {
        let cert_path = self.ca_cert_path();
        let key_path = self.ca_key_path();

        match load_ca(&cert_path, &key_path) {
            Ok(ca) => {
                repair_permissions(&[&cert_path, &key_path])?;
                return Ok(ca);
            }
            Err(e) => {
                tracing::info!(reason = %e, path = %cert_path.display(), "Generating local CA");
            }
        }

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS);
        params.serial_number = Some(random_serial());

        let cert = params.self_signed(&key)?;
        write_pem(&cert_path, &cert.pem())?;
        write_pem(&key_path, &key.serialize_pem())?;

        let der = cert.der().clone();
        Ok(CaMaterial { cert, key, der })
    }

    fn load_leaf(&self, ca: &CaMaterial) -> Result<LeafMaterial, CertError> {
        let cert_pem = read_pem(&self.leaf_cert_path())?;
        let key_pem = read_pem(&self.leaf_key_path())?;
        let key = KeyPair::from_pem(&key_pem)?;

        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let renew_at = OffsetDateTime::now_utc() + Duration::days(LEAF_RENEW_WINDOW_DAYS);
        if params.not_after <= renew_at {
            return Err(CertError::Invalid("leaf expires within renewal window".into()));
        }
        if !has_localhost_sans(&params.subject_alt_names) {
            return Err(CertError::Invalid("leaf is missing a localhost SAN".into()));
        }

        let leaf_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| CertError::Invalid(format!("leaf PEM: {}", e)))?;
        verify_chain(&ca.der, &leaf_der)?;

        Ok(LeafMaterial {
            fingerprint: format_fingerprint(key.public_key_raw()),
            cert_pem,
            key_pem,
        })
    }
}

fn load_ca(cert_path: &Path, key_path: &Path) -> Result<CaMaterial, CertError> {
    let cert_pem = read_pem(cert_path)?;
    let key_pem = read_pem(key_path)?;
    let key = KeyPair::from_pem(&key_pem)?;

    let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
    if !matches!(params.is_ca, IsCa::Ca(_)) {
        return Err(CertError::Invalid("stored CA is not a CA certificate".into()));
    }
    if params.not_after <= OffsetDateTime::now_utc() {
        return Err(CertError::Invalid("stored CA has expired".into()));
    }

    let der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
        .map_err(|e| CertError::Invalid(format!("CA PEM: {}", e)))?;
    let cert = params.self_signed(&key)?;
    let ca = CaMaterial { cert, key, der };

    // A key that does not belong to the certificate signs leaves that never verify.
    let probe = issue_leaf(&ca, OffsetDateTime::now_utc() + Duration::days(1))?;
    let probe_der = CertificateDer::from_pem_slice(probe.cert_pem.as_bytes())
        .map_err(|e| CertError::Invalid(format!("probe PEM: {}", e)))?;
    verify_chain(&ca.der, &probe_der)
        .map_err(|_| CertError::Invalid("stored CA key does not match its certificate".into()))?;

    Ok(ca)
}

fn issue_leaf(ca: &CaMaterial, not_after: OffsetDateTime) -> Result<LeafMaterial, CertError> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(LEAF_COMMON_NAME);
    params.subject_alt_names = vec![
        SanType::DnsName(LEAF_COMMON_NAME.try_into()?),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = OffsetDateTime::now_utc() - Duration::hours(1);
    params.not_after = not_after;
    params.serial_number = Some(random_serial());
    params.use_authority_key_identifier_extension = true;

    let cert = params.signed_by(&key, &ca.cert, &ca.key)?;

    Ok(LeafMaterial {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        fingerprint: format_fingerprint(key.public_key_raw()),
    })
}

/// Verify that `leaf` chains to `ca` and is valid for `localhost` right now.
fn verify_chain(ca: &CertificateDer<'static>, leaf: &CertificateDer<'_>) -> Result<(), CertError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(ca.clone())
        .map_err(|e| CertError::Invalid(format!("CA rejected as trust anchor: {}", e)))?;

    let verifier = WebPkiServerVerifier::builder_with_provider(
        Arc::new(roots),
        Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
    )
    .build()
    .map_err(|e| CertError::Invalid(format!("verifier: {}", e)))?;

    let server_name = ServerName::try_from(LEAF_SERVER_NAME)
        .map_err(|e| CertError::Invalid(e.to_string()))?;

    verifier
        .verify_server_cert(leaf, &[], &server_name, &[], UnixTime::now())
        .map_err(|e| CertError::Invalid(format!("leaf does not verify: {}", e)))?;
    Ok(())
}

fn has_localhost_sans(sans: &[SanType]) -> bool {
    let has_dns = sans.iter().any(|san| {
        matches!(san, SanType::DnsName(name) if name.as_str().eq_ignore_ascii_case(LEAF_COMMON_NAME))
    });
    let has_ip = |ip: IpAddr| sans.iter().any(|san| matches!(san, SanType::IpAddress(a) if *a == ip));

    has_dns
        && has_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        && has_ip(IpAddr::V6(Ipv6Addr::LOCALHOST))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Random positive 128-bit serial.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    SerialNumber::from_slice(&bytes)
}

/// Format public key bytes as colon-separated uppercase hex (`04:AB:...`).
pub fn format_fingerprint(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn read_pem(path: &Path) -> Result<String, CertError> {
    fs::read_to_string(path).map_err(|e| CertError::io(path, e))
}

fn write_pem(path: &Path, pem: &str) -> Result<(), CertError> {
    persist::write_private(path, pem.as_bytes()).map_err(|e| CertError::io(path, e))
}

fn repair_permissions(paths: &[&Path]) -> Result<(), CertError> {
    for path in paths {
        if persist::repair_mode(path, PRIVATE_FILE_MODE).map_err(|e| CertError::io(path, e))? {
            tracing::warn!(path = %path.display(), "Restored owner-only permissions");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn authority() -> (CertAuthority, TempDir) {
        let dir = TempDir::new().unwrap();
        (CertAuthority::new(dir.path().join("certs")), dir)
    }

    #[test]
    fn test_format_fingerprint() {
        assert_eq!(format_fingerprint(&[0x04, 0xab, 0x0f]), "04:AB:0F");
        assert_eq!(format_fingerprint(&[]), "");
    }

    #[test]
    fn test_ensure_ca_is_stable() {
        let (authority, _dir) = authority();

        let path = authority.ensure_ca().unwrap();
        let first = fs::read_to_string(&path).unwrap();
        authority.ensure_ca().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), first);
        assert!(authority.ca_key_path().exists());
    }

    #[test]
    fn test_leaf_is_reused_when_valid() {
        let (authority, _dir) = authority();

        let first = authority.ensure_leaf().unwrap();
        let second = authority.ensure_leaf().unwrap();

        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(first.fingerprint.starts_with("04:"));
        // Uncompressed P-256 point: 65 bytes.
        assert_eq!(first.fingerprint.split(':').count(), 65);
    }

    #[test]
    fn test_leaf_near_expiry_is_reissued() {
        let (authority, _dir) = authority();
        let ca = authority.load_or_create_ca().unwrap();

        let short = issue_leaf(&ca, OffsetDateTime::now_utc() + Duration::days(10)).unwrap();
        write_pem(&authority.leaf_cert_path(), &short.cert_pem).unwrap();
        write_pem(&authority.leaf_key_path(), &short.key_pem).unwrap();

        let renewed = authority.ensure_leaf().unwrap();
        assert_ne!(renewed.cert_pem, short.cert_pem);
        assert_eq!(
            fs::read_to_string(authority.leaf_cert_path()).unwrap(),
            renewed.cert_pem
        );
    }

    #[test]
    fn test_leaf_from_other_ca_is_reissued() {
        let (authority, _dir) = authority();
        let (other, _other_dir) = self::authority();

        let foreign = other.ensure_leaf().unwrap();
        authority.ensure_ca().unwrap();
        write_pem(&authority.leaf_cert_path(), &foreign.cert_pem).unwrap();
        write_pem(&authority.leaf_key_path(), &foreign.key_pem).unwrap();

        let leaf = authority.ensure_leaf().unwrap();
        assert_ne!(leaf.cert_pem, foreign.cert_pem);
    }

    #[test]
    fn test_malformed_leaf_is_reissued() {
        let (authority, _dir) = authority();
        authority.ensure_leaf().unwrap();
        fs::write(authority.leaf_cert_path(), "garbage").unwrap();

        let leaf = authority.ensure_leaf().unwrap();
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_corrupt_ca_is_regenerated() {
        let (authority, _dir) = authority();
        authority.ensure_ca().unwrap();
        fs::write(authority.ca_key_path(), "not a key").unwrap();

        authority.ensure_ca().unwrap();
        let key = fs::read_to_string(authority.ca_key_path()).unwrap();
        assert!(key.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_sans_required() {
        let complete = vec![
            SanType::DnsName("LOCALHOST".try_into().unwrap()),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ];
        assert!(has_localhost_sans(&complete));
        assert!(!has_localhost_sans(&complete[..2]));
    }

    #[cfg(unix)]
    #[test]
    fn test_material_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (authority, _dir) = authority();
        authority.ensure_leaf().unwrap();
        fs::set_permissions(
            authority.leaf_key_path(),
            fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        authority.ensure_leaf().unwrap();
        for path in [authority.ca_key_path(), authority.leaf_key_path()] {
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600, "{}", path.display());
        }
    }
}
