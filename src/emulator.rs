//! Outbound TLS client that reproduces a browser's Client Hello.
//!
//! One BoringSSL connector is built per process from the selected
//! [`BrowserProfile`]. BoringSSL writes extensions in a fixed order and picks
//! the TLS 1.3 suite order itself, so a profile is only accepted when its
//! tables describe a hello BoringSSL can produce. See [`check_wire_shape`].
use crate::errors::{Error, Result};
use crate::fingerprint::{is_grease, BrowserProfile, Extension, TlsVersion, GREASE};
use crate::session::KeyLog;
use boring::ssl::{
  CertificateCompressionAlgorithm, CertificateCompressor, SslConnector, SslConnectorBuilder,
  SslMethod, SslOptions, SslVerifyMode, SslVersion,
};
use boring::x509::X509;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_boring::SslStream;
use tokio_rustls::rustls::pki_types::CertificateDer;

const EXT_STATUS_REQUEST: u16 = 5;
const EXT_SIGNED_CERTIFICATE_TIMESTAMP: u16 = 18;
const EXT_SESSION_TICKET: u16 = 35;
const EXT_ENCRYPTED_CLIENT_HELLO: u16 = 0xfe0d;

const X25519_MLKEM768: u16 = 0x11ec;

/// Knobs for [`TlsEmulator::new`]
#[derive(Clone)]
pub struct EmulatorOptions {
  /// Verify the origin's certificate chain and hostname
  pub verify: bool,
  /// Trusted in addition to the system store
  pub extra_roots: Vec<CertificateDer<'static>>,
  /// Bound on one outbound handshake
  pub handshake_timeout: Duration,
  /// Where to write the outbound leg's secrets
  pub key_log: Option<Arc<KeyLog>>,
}

impl Default for EmulatorOptions {
  fn default() -> Self {
    Self {
      verify: true,
      extra_roots: Vec::new(),
      handshake_timeout: Duration::from_secs(15),
      key_log: None,
    }
  }
}

/// Performs outbound handshakes shaped like [`BrowserProfile`].
pub struct TlsEmulator {
  profile: &'static BrowserProfile,
  connector: SslConnector,
  verify: bool,
  ech_grease: bool,
  handshake_timeout: Duration,
}

impl TlsEmulator {
  /// Build the connector for `profile`. A profile BoringSSL cannot reproduce,
  /// or any setting it rejects, is a configuration error.
  pub fn new(profile: &'static BrowserProfile, options: EmulatorOptions) -> Result<Self> {
    check_wire_shape(profile)?;
    let setting = |what: &str, e: boring::error::ErrorStack| {
      Error::configuration(format!("{} for profile {}: {}", what, profile.name, e))
    };

    let mut builder =
      SslConnector::builder(SslMethod::tls()).map_err(|e| setting("TLS connector", e))?;

    builder
      .set_min_proto_version(Some(ssl_version(profile.min_version)))
      .map_err(|e| setting("minimum version", e))?;
    builder
      .set_max_proto_version(Some(ssl_version(profile.max_version)))
      .map_err(|e| setting("maximum version", e))?;
    builder
      .set_cipher_list(&cipher_list(profile)?)
      .map_err(|e| setting("cipher list", e))?;
    builder
      .set_curves_list(&curves_list(profile)?)
      .map_err(|e| setting("supported groups", e))?;
    builder
      .set_sigalgs_list(&sigalgs_list(profile)?)
      .map_err(|e| setting("signature algorithms", e))?;
    builder
      .set_alpn_protos(&alpn_wire(&profile.alpn_protocols())?)
      .map_err(|e| setting("ALPN", e))?;

    builder.set_grease_enabled(profile.grease());
    if profile.has_extension(EXT_STATUS_REQUEST) {
      builder.enable_ocsp_stapling();
    }
    if profile.has_extension(EXT_SIGNED_CERTIFICATE_TIMESTAMP) {
      builder.enable_signed_cert_timestamps();
    }
    if !profile.has_extension(EXT_SESSION_TICKET) {
      builder.set_options(SslOptions::NO_TICKET);
    }
    add_certificate_compression(&mut builder, profile)?;

    if options.verify {
      for root in &options.extra_roots {
        let cert = X509::from_der(root.as_ref()).map_err(|e| setting("extra root", e))?;
        builder
          .cert_store_mut()
          .add_cert(cert)
          .map_err(|e| setting("extra root", e))?;
      }
    } else {
      tracing::warn!("origin certificate verification is disabled");
      builder.set_verify(SslVerifyMode::NONE);
    }

    if let Some(key_log) = options.key_log {
      builder.set_keylog_callback(move |_, line| key_log.log_line(line));
    }

    tracing::info!(
      "emulating {} (ja3 {})",
      profile.name,
      profile.ja3_string()
    );

    Ok(TlsEmulator {
      profile,
      connector: builder.build(),
      verify: options.verify,
      ech_grease: profile.has_extension(EXT_ENCRYPTED_CLIENT_HELLO),
      handshake_timeout: options.handshake_timeout,
    })
  }

  /// The profile this emulator reproduces
  pub fn profile(&self) -> &'static BrowserProfile {
    self.profile
  }

  /// Handshake with `host` over `stream` offering the profile's ALPN list.
  pub async fn connect<S>(&self, host: &str, stream: S) -> Result<EmulatedStream<S>>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    self.connect_with_alpn(host, stream, None).await
  }

  /// Like [`TlsEmulator::connect`], with `alpn` replacing the profile's ALPN
  /// list when given. See [`TlsEmulator::alpn_for_client`].
  pub async fn connect_with_alpn<S>(
    &self,
    host: &str,
    stream: S,
    alpn: Option<&[Vec<u8>]>,
  ) -> Result<EmulatedStream<S>>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let mut config = self
      .connector
      .configure()
      .map_err(|e| Error::handshake(format!("configure TLS for {}: {}", host, e)))?;
    if !self.verify {
      config.set_verify_hostname(false);
    }
    config.set_enable_ech_grease(self.ech_grease);
    if let Some(protocols) = alpn {
      config
        .set_alpn_protos(&alpn_wire(protocols)?)
        .map_err(|e| Error::handshake(format!("ALPN for {}: {}", host, e)))?;
    }

    let inner = tokio::time::timeout(
      self.handshake_timeout,
      tokio_boring::connect(config, host, stream),
    )
    .await
    .map_err(|_| {
      Error::handshake(format!(
        "TLS handshake with {} timed out after {:?}",
        host, self.handshake_timeout
      ))
    })?
    .map_err(|e| Error::handshake(format!("TLS handshake with {} failed: {}", host, e)))?;

    Ok(EmulatedStream { inner })
  }

  /// ALPN list to offer the origin on behalf of a client that offered
  /// `client_offer`, or `None` to keep the profile's list unchanged.
  ///
  /// The origin may only pick a protocol the client also speaks. A client
  /// without ALPN is an HTTP/1.1 client. A narrowed list changes the ALPN
  /// extension, so that hello no longer matches the profile.
  pub fn alpn_for_client(&self, client_offer: &[Vec<u8>]) -> Option<Vec<Vec<u8>>> {
    let profile = self.profile.alpn_protocols();
    if !client_offer.is_empty() && profile.iter().all(|p| client_offer.contains(p)) {
      return None;
    }
    let narrowed: Vec<Vec<u8>> = if client_offer.is_empty() {
      profile
        .into_iter()
        .filter(|p| p.as_slice() == b"http/1.1")
        .collect()
    } else {
      profile
        .into_iter()
        .filter(|p| client_offer.contains(p))
        .collect()
    };
    tracing::debug!(
      "narrowing ALPN of {} to {:?} for a client offering {:?}",
      self.profile.name,
      printable(&narrowed),
      printable(client_offer)
    );
    Some(narrowed)
  }
}

/// An established outbound TLS connection.
pub struct EmulatedStream<S> {
  inner: SslStream<S>,
}

impl<S> EmulatedStream<S> {
  /// Protocol the origin selected, if any
  pub fn alpn(&self) -> Option<&[u8]> {
    self.inner.ssl().selected_alpn_protocol()
  }

  /// Negotiated protocol version, for logging
  pub fn version(&self) -> &'static str {
    self.inner.ssl().version_str()
  }

  /// The underlying raw stream
  pub fn get_ref(&self) -> &S {
    self.inner.get_ref()
  }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for EmulatedStream<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for EmulatedStream<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

fn ssl_version(version: TlsVersion) -> SslVersion {
  match version {
    TlsVersion::Tls10 => SslVersion::TLS1,
    TlsVersion::Tls11 => SslVersion::TLS1_1,
    TlsVersion::Tls12 => SslVersion::TLS1_2,
    TlsVersion::Tls13 => SslVersion::TLS1_3,
  }
}

fn printable(protocols: &[Vec<u8>]) -> Vec<String> {
  protocols
    .iter()
    .map(|p| String::from_utf8_lossy(p).into_owned())
    .collect()
}

/// Position of an extension in BoringSSL's fixed write order, `None` for
/// extensions it never sends as a client.
fn wire_rank(extension: &Extension) -> Option<u8> {
  Some(match extension {
    Extension::ServerName => 1,
    Extension::EncryptedClientHello => 2,
    Extension::ExtendedMasterSecret => 3,
    Extension::RenegotiationInfo => 4,
    Extension::SupportedGroups => 5,
    Extension::EcPointFormats(_) => 6,
    Extension::SessionTicket => 7,
    Extension::Alpn => 8,
    Extension::StatusRequest => 9,
    Extension::SignatureAlgorithms => 10,
    Extension::SignedCertificateTimestamp => 11,
    Extension::KeyShare(_) => 12,
    Extension::PskKeyExchangeModes(_) => 13,
    Extension::SupportedVersions(_) => 14,
    Extension::CompressCertificate(_) => 15,
    Extension::Padding => 17,
    Extension::Grease
    | Extension::ApplicationSettings(_)
    | Extension::DelegatedCredentials(_)
    | Extension::RecordSizeLimit(_) => return None,
  })
}

fn is_post_quantum(group: u16) -> bool {
  group == X25519_MLKEM768
}

/// Key shares BoringSSL generates: GREASE, the first group, and the first
/// later group on the other side of the post-quantum divide.
fn predicted_key_shares(profile: &BrowserProfile) -> Vec<u16> {
  let groups: Vec<u16> = profile
    .supported_groups
    .iter()
    .copied()
    .filter(|g| !is_grease(*g))
    .collect();
  let mut shares = Vec::new();
  if profile.grease() {
    shares.push(GREASE);
  }
  if let Some(first) = groups.first() {
    shares.push(*first);
    if let Some(second) = groups
      .iter()
      .find(|g| is_post_quantum(**g) != is_post_quantum(*first))
    {
      shares.push(*second);
    }
  }
  shares
}

fn predicted_versions(profile: &BrowserProfile) -> Vec<u16> {
  let mut versions = Vec::new();
  if profile.grease() {
    versions.push(GREASE);
  }
  for version in [
    TlsVersion::Tls13,
    TlsVersion::Tls12,
    TlsVersion::Tls11,
    TlsVersion::Tls10,
  ] {
    if (profile.min_version..=profile.max_version).contains(&version) {
      versions.push(version.code());
    }
  }
  versions
}

/// Reject a profile whose declared Client Hello differs from what BoringSSL
/// would write for it.
fn check_wire_shape(profile: &BrowserProfile) -> Result<()> {
  let mismatch = |what: String| {
    Error::configuration(format!(
      "profile {} cannot be reproduced: {}",
      profile.name, what
    ))
  };
  let grease = profile.grease();
  let tls13 = profile.max_version >= TlsVersion::Tls13;
  let tls12 = profile.min_version < TlsVersion::Tls13;

  // GREASE opens the list at rank 0 and closes it at 16, before padding
  let mut greases = 0;
  let mut last: Option<u8> = None;
  for extension in profile.extensions {
    let rank = match extension {
      Extension::Grease => {
        greases += 1;
        if greases == 1 {
          0
        } else {
          16
        }
      }
      other => wire_rank(other).ok_or_else(|| {
        mismatch(format!("BoringSSL does not send extension {}", other.code()))
      })?,
    };
    if last.is_some_and(|l| rank <= l) {
      return Err(mismatch(format!(
        "extension {} is out of BoringSSL's order",
        extension.code()
      )));
    }
    last = Some(rank);
  }
  if grease && greases != 2 {
    return Err(mismatch("GREASE must open and close the extensions".into()));
  }

  let mut required = vec![0u16, 10, 13];
  if !profile.alpn.is_empty() {
    required.push(16);
  }
  if tls12 {
    required.extend([23, 65281, 11]);
  }
  if tls13 {
    required.extend([51, 45, 43]);
  }
  if let Some(code) = required.iter().find(|c| !profile.has_extension(**c)) {
    return Err(mismatch(format!("extension {} is always sent", code)));
  }
  if !tls13 && profile.has_extension(EXT_ENCRYPTED_CLIENT_HELLO) {
    return Err(mismatch("ECH GREASE needs TLS 1.3".into()));
  }

  for (what, first) in [
    ("cipher suites", profile.cipher_suites.first()),
    ("groups", profile.supported_groups.first()),
  ] {
    if first.is_some_and(|v| is_grease(*v)) != grease {
      return Err(mismatch(format!("{} must start with GREASE exactly when GREASE is on", what)));
    }
  }
  if profile.cipher_suites.iter().skip(1).any(|c| is_grease(*c)) {
    return Err(mismatch("GREASE only leads the cipher suites".into()));
  }
  let mut tls13_suites: Vec<u16> = profile.tls13_cipher_suites().collect();
  tls13_suites.sort_unstable();
  if tls13 && tls13_suites != [0x1301u16, 0x1302, 0x1303] {
    return Err(mismatch("BoringSSL always offers all three TLS 1.3 suites".into()));
  }

  for extension in profile.extensions {
    let (declared, predicted) = match extension {
      Extension::KeyShare(groups) => (groups.to_vec(), predicted_key_shares(profile)),
      Extension::SupportedVersions(versions) => (versions.to_vec(), predicted_versions(profile)),
      Extension::EcPointFormats(formats) => (
        formats.iter().map(|f| u16::from(*f)).collect(),
        vec![0],
      ),
      Extension::PskKeyExchangeModes(modes) => {
        (modes.iter().map(|m| u16::from(*m)).collect(), vec![1])
      }
      _ => continue,
    };
    if declared != predicted {
      return Err(mismatch(format!(
        "extension {} carries {:x?}, BoringSSL sends {:x?}",
        extension.code(),
        declared,
        predicted
      )));
    }
  }
  Ok(())
}

/// Receive-side support for compressed server certificates (RFC 8879).
/// Registering an algorithm is what puts it in `compress_certificate`.
struct ZlibDecompressor;

impl CertificateCompressor for ZlibDecompressor {
  const ALGORITHM: CertificateCompressionAlgorithm = CertificateCompressionAlgorithm::ZLIB;
  const CAN_COMPRESS: bool = false;
  const CAN_DECOMPRESS: bool = true;

  fn decompress<W>(&self, input: &[u8], output: &mut W) -> io::Result<()>
  where
    W: io::Write,
  {
    io::copy(&mut flate2::read::ZlibDecoder::new(input), output).map(|_| ())
  }
}

struct BrotliDecompressor;

impl CertificateCompressor for BrotliDecompressor {
  const ALGORITHM: CertificateCompressionAlgorithm = CertificateCompressionAlgorithm::BROTLI;
  const CAN_COMPRESS: bool = false;
  const CAN_DECOMPRESS: bool = true;

  fn decompress<W>(&self, input: &[u8], output: &mut W) -> io::Result<()>
  where
    W: io::Write,
  {
    brotli::BrotliDecompress(&mut io::Cursor::new(input), output)
  }
}

fn add_certificate_compression(
  builder: &mut SslConnectorBuilder,
  profile: &BrowserProfile,
) -> Result<()> {
  let algorithms = profile
    .extensions
    .iter()
    .find_map(|e| match e {
      Extension::CompressCertificate(algorithms) => Some(*algorithms),
      _ => None,
    })
    .unwrap_or_default();
  for algorithm in algorithms {
    let added = match algorithm {
      1 => builder.add_certificate_compression_algorithm(ZlibDecompressor),
      2 => builder.add_certificate_compression_algorithm(BrotliDecompressor),
      other => {
        return Err(Error::configuration(format!(
          "profile {} lists unsupported certificate compression {}",
          profile.name, other
        )))
      }
    };
    added.map_err(|e| {
      Error::configuration(format!(
        "certificate compression for profile {}: {}",
        profile.name, e
      ))
    })?;
  }
  Ok(())
}

/// BoringSSL cipher-list string of the profile's TLS 1.2 suites, in order.
fn cipher_list(profile: &BrowserProfile) -> Result<String> {
  let names = profile
    .tls12_cipher_suites()
    .map(|suite| {
      cipher_name(suite).ok_or_else(|| {
        Error::configuration(format!(
          "profile {} lists unsupported cipher suite {:#06x}",
          profile.name, suite
        ))
      })
    })
    .collect::<Result<Vec<_>>>()?;
  Ok(names.join(":"))
}

fn curves_list(profile: &BrowserProfile) -> Result<String> {
  let names = profile
    .supported_groups
    .iter()
    .filter(|g| !is_grease(**g))
    .map(|group| {
      group_name(*group).ok_or_else(|| {
        Error::configuration(format!(
          "profile {} lists unsupported group {:#06x}",
          profile.name, group
        ))
      })
    })
    .collect::<Result<Vec<_>>>()?;
  Ok(names.join(":"))
}

fn sigalgs_list(profile: &BrowserProfile) -> Result<String> {
  let names = profile
    .signature_algorithms
    .iter()
    .map(|alg| {
      sigalg_name(*alg).ok_or_else(|| {
        Error::configuration(format!(
          "profile {} lists unsupported signature algorithm {:#06x}",
          profile.name, alg
        ))
      })
    })
    .collect::<Result<Vec<_>>>()?;
  Ok(names.join(":"))
}

/// Length-prefixed protocol list as sent in the ALPN extension.
fn alpn_wire(protocols: &[Vec<u8>]) -> Result<Vec<u8>> {
  let mut wire = Vec::new();
  for protocol in protocols {
    if protocol.is_empty() || protocol.len() > u8::MAX as usize {
      return Err(Error::configuration(format!(
        "ALPN protocol {:?} has invalid length",
        String::from_utf8_lossy(protocol)
      )));
    }
    wire.push(protocol.len() as u8);
    wire.extend_from_slice(protocol);
  }
  Ok(wire)
}

fn cipher_name(suite: u16) -> Option<&'static str> {
  Some(match suite {
    0xc02b => "ECDHE-ECDSA-AES128-GCM-SHA256",
    0xc02f => "ECDHE-RSA-AES128-GCM-SHA256",
    0xc02c => "ECDHE-ECDSA-AES256-GCM-SHA384",
    0xc030 => "ECDHE-RSA-AES256-GCM-SHA384",
    0xcca9 => "ECDHE-ECDSA-CHACHA20-POLY1305",
    0xcca8 => "ECDHE-RSA-CHACHA20-POLY1305",
    0xc009 => "ECDHE-ECDSA-AES128-SHA",
    0xc00a => "ECDHE-ECDSA-AES256-SHA",
    0xc013 => "ECDHE-RSA-AES128-SHA",
    0xc014 => "ECDHE-RSA-AES256-SHA",
    0x009c => "AES128-GCM-SHA256",
    0x009d => "AES256-GCM-SHA384",
    0x002f => "AES128-SHA",
    0x0035 => "AES256-SHA",
    _ => return None,
  })
}

fn group_name(group: u16) -> Option<&'static str> {
  Some(match group {
    X25519_MLKEM768 => "X25519MLKEM768",
    0x001d => "X25519",
    0x0017 => "P-256",
    0x0018 => "P-384",
    0x0019 => "P-521",
    _ => return None,
  })
}

fn sigalg_name(alg: u16) -> Option<&'static str> {
  Some(match alg {
    0x0401 => "RSA+SHA256",
    0x0501 => "RSA+SHA384",
    0x0601 => "RSA+SHA512",
    0x0403 => "ECDSA+SHA256",
    0x0503 => "ECDSA+SHA384",
    0x0603 => "ECDSA+SHA512",
    0x0804 => "RSA-PSS+SHA256",
    0x0805 => "RSA-PSS+SHA384",
    0x0806 => "RSA-PSS+SHA512",
    0x0807 => "ed25519",
    _ => return None,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_profile_maps_to_boringssl_names() {
    for name in BrowserProfile::names() {
      let profile = BrowserProfile::lookup(name).unwrap();
      assert!(cipher_list(profile).is_ok(), "{}", name);
      assert!(curves_list(profile).is_ok(), "{}", name);
      assert!(sigalgs_list(profile).is_ok(), "{}", name);
    }
  }

  #[test]
  fn chrome_cipher_list_keeps_order() {
    let chrome = BrowserProfile::lookup("chrome133").unwrap();
    assert_eq!(
      cipher_list(chrome).unwrap(),
      "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
       ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:\
       ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305:\
       ECDHE-RSA-AES128-SHA:ECDHE-RSA-AES256-SHA:\
       AES128-GCM-SHA256:AES256-GCM-SHA384:AES128-SHA:AES256-SHA"
    );
    assert_eq!(
      curves_list(chrome).unwrap(),
      "X25519MLKEM768:X25519:P-256:P-384"
    );
  }

  #[test]
  fn every_profile_is_reproducible() {
    for name in BrowserProfile::names() {
      let profile = BrowserProfile::lookup(name).unwrap();
      check_wire_shape(profile).unwrap();
      assert_eq!(profile.key_share_groups(), predicted_key_shares(profile));
    }
  }

  fn variant(extensions: &'static [Extension]) -> BrowserProfile {
    let firefox = BrowserProfile::lookup("firefox117").unwrap();
    BrowserProfile {
      name: "variant",
      extensions,
      ..*firefox
    }
  }

  #[test]
  fn unsendable_profiles_are_rejected() {
    use Extension::*;
    check_wire_shape(&variant(&[
      ServerName,
      ExtendedMasterSecret,
      RenegotiationInfo,
      SupportedGroups,
      EcPointFormats(&[0]),
      Alpn,
      SignatureAlgorithms,
      KeyShare(&[0x001d]),
      PskKeyExchangeModes(&[1]),
      SupportedVersions(&[0x0304, 0x0303]),
    ]))
    .unwrap();

    // not implemented by BoringSSL
    let err = check_wire_shape(&variant(&[
      ServerName,
      ExtendedMasterSecret,
      RenegotiationInfo,
      SupportedGroups,
      EcPointFormats(&[0]),
      Alpn,
      SignatureAlgorithms,
      KeyShare(&[0x001d]),
      PskKeyExchangeModes(&[1]),
      SupportedVersions(&[0x0304, 0x0303]),
      DelegatedCredentials(&[0x0403]),
    ]))
    .unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("34"), "{}", err);
    // key_share before signature_algorithms is not BoringSSL's order
    assert!(check_wire_shape(&variant(&[
      ServerName,
      ExtendedMasterSecret,
      RenegotiationInfo,
      SupportedGroups,
      EcPointFormats(&[0]),
      Alpn,
      KeyShare(&[0x001d]),
      SignatureAlgorithms,
      PskKeyExchangeModes(&[1]),
      SupportedVersions(&[0x0304, 0x0303]),
    ]))
    .is_err());
    // one key share per group is not what BoringSSL generates
    assert!(check_wire_shape(&variant(&[
      ServerName,
      ExtendedMasterSecret,
      RenegotiationInfo,
      SupportedGroups,
      EcPointFormats(&[0]),
      Alpn,
      SignatureAlgorithms,
      KeyShare(&[0x001d, 0x0017]),
      PskKeyExchangeModes(&[1]),
      SupportedVersions(&[0x0304, 0x0303]),
    ]))
    .is_err());
    // signature_algorithms is always sent
    assert!(check_wire_shape(&variant(&[
      ServerName,
      ExtendedMasterSecret,
      RenegotiationInfo,
      SupportedGroups,
      EcPointFormats(&[0]),
      Alpn,
      KeyShare(&[0x001d]),
      PskKeyExchangeModes(&[1]),
      SupportedVersions(&[0x0304, 0x0303]),
    ]))
    .is_err());
  }

  #[test]
  fn alpn_wire_format() {
    let wire = alpn_wire(&[b"h2".to_vec(), b"http/1.1".to_vec()]).unwrap();
    assert_eq!(wire, b"\x02h2\x08http/1.1");
    assert!(alpn_wire(&[Vec::new()]).is_err());
  }

  #[test]
  fn client_alpn_narrows_only_when_needed() {
    let emulator = TlsEmulator::new(
      BrowserProfile::lookup("chrome133").unwrap(),
      EmulatorOptions {
        verify: false,
        ..Default::default()
      },
    )
    .unwrap();
    let browser = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    assert_eq!(emulator.alpn_for_client(&browser), None);
    assert_eq!(
      emulator.alpn_for_client(&[b"http/1.1".to_vec()]),
      Some(vec![b"http/1.1".to_vec()])
    );
    assert_eq!(
      emulator.alpn_for_client(&[]),
      Some(vec![b"http/1.1".to_vec()])
    );
  }
}
