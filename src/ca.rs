//! Certificate Authority (CA) management
//!
//! The root CA is loaded from (or generated into) a pair of PEM files at
//! startup. Leaf certificates are minted per intercepted hostname and kept in
//! a concurrent cache so each host is signed once per validity period.
//!

use crate::errors::{Error, Result};
use moka::future::Cache;
use moka::Expiry;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{KeyLog, ServerConfig};

/// Root certificate validity (10 years)
const CA_VALIDITY_DAYS: i64 = 3650;
/// Leaf certificate validity in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// A cached leaf is never served for longer than this
const CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(12 * 60 * 60);
/// Cached leaves are retired this long before their own not_after
const RENEW_BEFORE_EXPIRY: Duration = Duration::hours(1);
/// Upper bound on distinct hostnames kept in memory
const CACHE_CAPACITY: u64 = 10_000;

/// Root Certificate Authority used to sign leaf certificates
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
  cert_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the CA from `cert_path`/`key_path`, or generate and persist a new one.
  ///
  /// Both files present: they are parsed and validated. Neither present: a new
  /// root is generated and written. Exactly one present is a configuration
  /// error, the proxy never pairs a stray key or certificate with fresh material.
  pub async fn load_or_generate(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
  ) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    let cert_exists = fs::try_exists(cert_path).await?;
    let key_exists = fs::try_exists(key_path).await?;

    match (cert_exists, key_exists) {
      (true, true) => Self::load(cert_path, key_path).await,
      (true, false) => Err(Error::configuration(format!(
        "found CA cert {} but no corresponding key {}",
        cert_path.display(),
        key_path.display()
      ))),
      (false, true) => Err(Error::configuration(format!(
        "found CA key {} but no corresponding cert {}",
        key_path.display(),
        cert_path.display()
      ))),
      (false, false) => {
        tracing::info!(
          "CA cert and key do not exist, generating {} and {}",
          cert_path.display(),
          key_path.display()
        );
        Self::generate(cert_path, key_path).await
      }
    }
  }

  /// Load existing CA certificate and key
  async fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::configuration(format!("Failed to parse CA key: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::configuration("No certificate found in CA PEM"))?
      .map_err(|e| Error::configuration(format!("Failed to parse CA PEM: {}", e)))?;

    let (not_before, not_after) = inspect_ca_cert(&cert_der)?;

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::configuration("Failed to serialize CA key"))?;
    ensure_key_matches(&cert_der, key_der)?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::configuration(format!("Failed to create issuer from CA cert: {}", e))
    })?;

    tracing::info!(
      "loaded CA {} (valid {} .. {})",
      cert_path.display(),
      not_before,
      not_after
    );

    Ok(Self {
      issuer,
      ca_cert_der: cert_der,
      ca_cert_pem: cert_pem,
      not_before,
      not_after,
      cert_path: cert_path.to_path_buf(),
    })
  }

  /// Generate a new CA certificate and key and write both to disk
  async fn generate(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "mimic-mitm Root CA");
    dn.push(DnType::OrganizationName, "mimic-mitm");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    // Whole seconds, so the in-memory window equals what gets encoded
    let now = truncate_to_second(OffsetDateTime::now_utc());
    let not_before = now - Duration::days(1);
    let not_after = now + Duration::days(CA_VALIDITY_DAYS);
    params.not_before = not_before;
    params.not_after = not_after;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::configuration(format!("Failed to generate CA key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::configuration(format!("Failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    for path in [cert_path, key_path] {
      if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
      }
    }
    fs::write(cert_path, cert_pem.as_bytes()).await?;
    fs::write(key_path, key_pem.as_bytes()).await?;
    restrict_permissions(key_path).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::configuration(format!("Failed to create issuer: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der: cert_der,
      ca_cert_pem: cert_pem,
      not_before,
      not_after,
      cert_path: cert_path.to_path_buf(),
    })
  }

  /// Sign a fresh leaf certificate for `hostname`.
  ///
  /// The result is not cached, use [`CertificateManager::get_or_issue`] on
  /// the connection path.
  pub fn issue(&self, hostname: &str) -> Result<LeafCert> {
    let hostname = normalize_hostname(hostname);
    if hostname.is_empty() {
      return Err(Error::certificate("empty hostname"));
    }

    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname.as_str());
    params.distinguished_name = dn;

    // An IP literal gets an iPAddress SAN plus the textual form as a dNSName,
    // clients differ on which of the two they match.
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.as_str().try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      if !is_dns_name(&hostname) {
        return Err(Error::certificate(format!("Invalid domain name: {}", hostname)));
      }
      vec![SanType::DnsName(hostname.as_str().try_into().map_err(|_| {
        Error::certificate(format!("Invalid domain name: {}", hostname))
      })?)]
    };
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let issued_at = truncate_to_second(OffsetDateTime::now_utc());
    let (not_before, not_after) = self.leaf_window(issued_at)?;
    params.not_before = not_before;
    params.not_after = not_after;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("Failed to sign leaf for {}: {}", hostname, e)))?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("Failed to serialize leaf key"))?;

    tracing::debug!("issued leaf certificate for {}", hostname);

    Ok(LeafCert {
      hostname,
      cert_chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      key,
      issued_at,
      not_before,
      not_after,
    })
  }

  /// Leaf validity clamped strictly inside the root's window.
  fn leaf_window(&self, now: OffsetDateTime) -> Result<(OffsetDateTime, OffsetDateTime)> {
    let not_before = (now - Duration::seconds(NOT_BEFORE_OFFSET))
      .max(self.not_before + Duration::seconds(1));
    let not_after = (now + Duration::seconds(LEAF_TTL_SECS)).min(self.not_after - Duration::seconds(1));
    if not_after <= now || not_after <= not_before {
      return Err(Error::certificate(format!(
        "CA validity window {} .. {} leaves no room for a leaf",
        self.not_before, self.not_after
      )));
    }
    Ok((not_before, not_after))
  }

  /// CA certificate in PEM format for client installation
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// CA certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Path the CA certificate was loaded from or written to
  pub fn ca_cert_path(&self) -> &Path {
    &self.cert_path
  }

  /// Start of the root's validity window
  pub fn not_before(&self) -> OffsetDateTime {
    self.not_before
  }

  /// End of the root's validity window
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
}

/// A signed leaf certificate and its key. Immutable once issued.
pub struct LeafCert {
  hostname: String,
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  issued_at: OffsetDateTime,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
}

impl LeafCert {
  /// Hostname the certificate was issued for (normalized)
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// `[leaf, root]`
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.cert_chain
  }

  /// The leaf alone
  pub fn leaf_der(&self) -> &CertificateDer<'static> {
    &self.cert_chain[0]
  }

  /// Private key matching the leaf
  pub fn key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }

  /// When the certificate was signed
  pub fn issued_at(&self) -> OffsetDateTime {
    self.issued_at
  }

  /// Start of the validity window
  pub fn not_before(&self) -> OffsetDateTime {
    self.not_before
  }

  /// End of the validity window
  pub fn expires_at(&self) -> OffsetDateTime {
    self.not_after
  }

  /// How long a cache may keep serving this certificate from now on.
  fn cache_lifetime(&self) -> std::time::Duration {
    let remaining = self.not_after - RENEW_BEFORE_EXPIRY - OffsetDateTime::now_utc();
    let remaining = std::time::Duration::try_from(remaining).unwrap_or_default();
    remaining.min(CACHE_TTL)
  }

  /// TLS server configuration presenting this certificate.
  ///
  /// `alpn` is the single protocol to agree on with the client, it mirrors
  /// whatever the real origin selected.
  pub fn server_config(
    &self,
    alpn: Option<&[u8]>,
    key_log: Option<Arc<dyn KeyLog>>,
  ) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
      .map_err(|e| Error::certificate(format!("Failed to create TLS config: {}", e)))?;
    if let Some(protocol) = alpn {
      config.alpn_protocols = vec![protocol.to_vec()];
    }
    if let Some(key_log) = key_log {
      config.key_log = key_log;
    }
    Ok(config)
  }
}

impl std::fmt::Debug for LeafCert {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LeafCert")
      .field("hostname", &self.hostname)
      .field("issued_at", &self.issued_at)
      .field("not_after", &self.not_after)
      .finish_non_exhaustive()
  }
}

struct LeafExpiry;

impl Expiry<String, Arc<LeafCert>> for LeafExpiry {
  fn expire_after_create(
    &self,
    _key: &String,
    value: &Arc<LeafCert>,
    _created_at: std::time::Instant,
  ) -> Option<std::time::Duration> {
    Some(value.cache_lifetime())
  }
}

/// Leaf certificate cache in front of a [`CertificateAuthority`]
pub struct CertificateManager {
  ca: Arc<CertificateAuthority>,
  cert_cache: Cache<String, Arc<LeafCert>>,
  issued: Arc<AtomicU64>,
}

impl CertificateManager {
  /// Create a new certificate manager
  pub fn new(ca: CertificateAuthority) -> Self {
    let cert_cache = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .expire_after(LeafExpiry)
      .build();

    Self {
      ca: Arc::new(ca),
      cert_cache,
      issued: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Return the cached leaf for `hostname`, issuing one on a miss.
  ///
  /// Concurrent callers for the same hostname share a single signing
  /// operation, the cache only serializes per key. Signing itself runs on the
  /// blocking pool so unrelated hostnames proceed in parallel.
  pub async fn get_or_issue(&self, hostname: &str) -> Result<Arc<LeafCert>> {
    let hostname = normalize_hostname(hostname);
    let ca = self.ca.clone();
    let issued = self.issued.clone();
    let key = hostname.clone();
    self
      .cert_cache
      .try_get_with(key, async move {
        let leaf = tokio::task::spawn_blocking(move || ca.issue(&hostname))
          .await
          .map_err(|e| Error::certificate(format!("signing task failed: {}", e)))??;
        issued.fetch_add(1, Ordering::Relaxed);
        Ok::<_, Error>(Arc::new(leaf))
      })
      .await
      .map_err(|e| Error::Certificate(e.to_string()))
  }

  /// Whether a live leaf for `hostname` is cached
  pub fn is_cached(&self, hostname: &str) -> bool {
    self.cert_cache.contains_key(&normalize_hostname(hostname))
  }

  /// Number of leaves signed so far
  pub fn issued_count(&self) -> u64 {
    self.issued.load(Ordering::Relaxed)
  }

  /// The root CA
  pub fn ca(&self) -> &CertificateAuthority {
    &self.ca
  }
}

/// Lower-case, strip a trailing dot and IPv6 brackets.
pub(crate) fn normalize_hostname(hostname: &str) -> String {
  let hostname = hostname.trim().trim_end_matches('.');
  let hostname = hostname
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(hostname);
  hostname.to_ascii_lowercase()
}

/// Labels of letters, digits, `-` and `_`, optionally led by a `*` label.
fn is_dns_name(hostname: &str) -> bool {
  hostname.len() <= 253
    && hostname.split('.').enumerate().all(|(i, label)| {
      (i == 0 && label == "*")
        || (!label.is_empty()
          && label.len() <= 63
          && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'))
    })
}

fn truncate_to_second(t: OffsetDateTime) -> OffsetDateTime {
  t.replace_nanosecond(0).unwrap_or(t)
}

/// Check the CA flag and key usage, and return the validity window.
fn inspect_ca_cert(der: &CertificateDer<'_>) -> Result<(OffsetDateTime, OffsetDateTime)> {
  let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
    .map_err(|e| Error::configuration(format!("Failed to parse CA cert: {}", e)))?;

  if !cert.is_ca() {
    return Err(Error::configuration("CA cert is not marked as a CA"));
  }
  if let Ok(Some(key_usage)) = cert.key_usage() {
    if !key_usage.value.key_cert_sign() {
      return Err(Error::configuration(
        "CA cert key usage does not permit certificate signing",
      ));
    }
  }

  let validity = cert.validity();
  let not_before = OffsetDateTime::from_unix_timestamp(validity.not_before.timestamp())
    .map_err(|e| Error::configuration(format!("CA not_before out of range: {}", e)))?;
  let not_after = OffsetDateTime::from_unix_timestamp(validity.not_after.timestamp())
    .map_err(|e| Error::configuration(format!("CA not_after out of range: {}", e)))?;
  Ok((not_before, not_after))
}

/// rustls refuses a certificate whose public key does not match the private key.
fn ensure_key_matches(cert: &CertificateDer<'static>, key: PrivateKeyDer<'static>) -> Result<()> {
  ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(vec![cert.clone()], key)
    .map(|_| ())
    .map_err(|e| Error::configuration(format!("CA key does not match CA cert: {}", e)))
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
  Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hostnames_are_normalized() {
    assert_eq!(normalize_hostname("Example.COM."), "example.com");
    assert_eq!(normalize_hostname("[::1]"), "::1");
    assert_eq!(normalize_hostname(" 10.0.0.1 "), "10.0.0.1");
  }

  #[test]
  fn dns_names() {
    assert!(is_dns_name("www.example.com"));
    assert!(is_dns_name("*.example.com"));
    assert!(is_dns_name("_dmarc.example.com"));
    assert!(!is_dns_name("bad host"));
    assert!(!is_dns_name("a..b"));
    assert!(!is_dns_name("www.*.com"));
  }
}
