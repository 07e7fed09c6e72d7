use super::{is_grease, join_decimal, GREASE};
use crate::errors::{Error, Result};

/// Protocol versions a profile may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
  Tls10,
  Tls11,
  Tls12,
  Tls13,
}

impl TlsVersion {
  /// Wire value
  pub fn code(&self) -> u16 {
    match self {
      TlsVersion::Tls10 => 0x0301,
      TlsVersion::Tls11 => 0x0302,
      TlsVersion::Tls12 => 0x0303,
      TlsVersion::Tls13 => 0x0304,
    }
  }
}

/// One Client Hello extension together with the payload shape it carries.
///
/// Extensions whose payload comes from another profile field (groups,
/// signature algorithms, ALPN) carry nothing here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
  /// A GREASE extension with an empty body
  Grease,
  ServerName,
  ExtendedMasterSecret,
  RenegotiationInfo,
  SupportedGroups,
  EcPointFormats(&'static [u8]),
  SessionTicket,
  Alpn,
  StatusRequest,
  SignatureAlgorithms,
  SignedCertificateTimestamp,
  /// Groups a key share is sent for
  KeyShare(&'static [u16]),
  PskKeyExchangeModes(&'static [u8]),
  SupportedVersions(&'static [u16]),
  /// Certificate compression algorithms (RFC 8879)
  CompressCertificate(&'static [u16]),
  /// ALPS, the value is the extension codepoint (17513 before Chrome 133, 17613 after)
  ApplicationSettings(u16),
  /// GREASE Encrypted Client Hello
  EncryptedClientHello,
  DelegatedCredentials(&'static [u16]),
  RecordSizeLimit(u16),
  /// Only sent when the hello would otherwise be 256 to 511 bytes long
  Padding,
}

impl Extension {
  /// Extension type on the wire. GREASE is reported as [`GREASE`].
  pub fn code(&self) -> u16 {
    match self {
      Extension::Grease => GREASE,
      Extension::ServerName => 0,
      Extension::StatusRequest => 5,
      Extension::SupportedGroups => 10,
      Extension::EcPointFormats(_) => 11,
      Extension::SignatureAlgorithms => 13,
      Extension::Alpn => 16,
      Extension::SignedCertificateTimestamp => 18,
      Extension::Padding => 21,
      Extension::ExtendedMasterSecret => 23,
      Extension::CompressCertificate(_) => 27,
      Extension::RecordSizeLimit(_) => 28,
      Extension::DelegatedCredentials(_) => 34,
      Extension::SessionTicket => 35,
      Extension::SupportedVersions(_) => 43,
      Extension::PskKeyExchangeModes(_) => 45,
      Extension::KeyShare(_) => 51,
      Extension::ApplicationSettings(codepoint) => *codepoint,
      Extension::EncryptedClientHello => 0xfe0d,
      Extension::RenegotiationInfo => 0xff01,
    }
  }
}

/// The Client Hello of one browser release. Every list is in wire order.
#[derive(Debug, PartialEq, Eq)]
pub struct BrowserProfile {
  pub name: &'static str,
  pub min_version: TlsVersion,
  pub max_version: TlsVersion,
  /// TLS 1.3 and TLS 1.2 suites, [`GREASE`] where the browser sends one
  pub cipher_suites: &'static [u16],
  pub extensions: &'static [Extension],
  pub supported_groups: &'static [u16],
  pub signature_algorithms: &'static [u16],
  pub alpn: &'static [&'static str],
  pub compression_methods: &'static [u8],
}

impl BrowserProfile {
  /// Find a profile by name, ignoring ASCII case.
  pub fn lookup(name: &str) -> Result<&'static BrowserProfile> {
    PROFILES
      .iter()
      .copied()
      .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
      .ok_or_else(|| {
        Error::configuration(format!(
          "unknown browser profile {:?}, available: {}",
          name,
          Self::names().join(", ")
        ))
      })
  }

  /// Every profile name, in table order
  pub fn names() -> Vec<&'static str> {
    PROFILES.iter().map(|p| p.name).collect()
  }

  /// Whether GREASE values are sent
  pub fn grease(&self) -> bool {
    self.extensions.contains(&Extension::Grease)
  }

  /// Whether an extension with wire type `code` is declared
  pub fn has_extension(&self, code: u16) -> bool {
    self.extensions.iter().any(|e| e.code() == code)
  }

  /// TLS 1.3 suites in profile order
  pub fn tls13_cipher_suites(&self) -> impl Iterator<Item = u16> + '_ {
    self
      .cipher_suites
      .iter()
      .copied()
      .filter(|c| !is_grease(*c) && c >> 8 == 0x13)
  }

  /// Suites negotiable in TLS 1.2 and below, in profile order
  pub fn tls12_cipher_suites(&self) -> impl Iterator<Item = u16> + '_ {
    self
      .cipher_suites
      .iter()
      .copied()
      .filter(|c| !is_grease(*c) && c >> 8 != 0x13)
  }

  /// ALPN protocol names
  pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
    self.alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
  }

  /// Extension codes as they compare against [`HelloShape::extensions`]:
  /// server name and padding left out, GREASE as [`GREASE`].
  ///
  /// [`HelloShape::extensions`]: super::HelloShape::extensions
  pub fn wire_extensions(&self) -> Vec<u16> {
    self
      .extensions
      .iter()
      .filter(|e| !matches!(e, Extension::ServerName | Extension::Padding))
      .map(|e| e.code())
      .collect()
  }

  /// Groups a key share is generated for
  pub fn key_share_groups(&self) -> &'static [u16] {
    self
      .extensions
      .iter()
      .find_map(|e| match e {
        Extension::KeyShare(groups) => Some(*groups),
        _ => None,
      })
      .unwrap_or_default()
  }

  /// JA3 string of the declared shape:
  /// `version,ciphers,extensions,groups,point_formats` with GREASE removed.
  /// Padding is left out, whether it is sent depends on the hello's length.
  pub fn ja3_string(&self) -> String {
    let point_formats = self
      .extensions
      .iter()
      .find_map(|e| match e {
        Extension::EcPointFormats(formats) => Some(*formats),
        _ => None,
      })
      .unwrap_or_default();
    format!(
      "{},{},{},{},{}",
      TlsVersion::Tls12.code(),
      join_decimal(self.cipher_suites.iter().filter(|c| !is_grease(**c))),
      join_decimal(
        self
          .extensions
          .iter()
          .filter(|e| !matches!(e, Extension::Grease | Extension::Padding))
          .map(|e| e.code())
      ),
      join_decimal(self.supported_groups.iter().filter(|g| !is_grease(**g))),
      join_decimal(point_formats),
    )
  }
}

static PROFILES: &[&BrowserProfile] = &[&CHROME_131, &CHROME_133, &FIREFOX_117, &SAFARI_18_0];

const CHROME_CIPHER_SUITES: &[u16] = &[
  GREASE, 0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013, 0xc014,
  0x009c, 0x009d, 0x002f, 0x0035,
];
/// X25519MLKEM768 first, as Chrome has sent since release 131
const CHROME_GROUPS: &[u16] = &[GREASE, 0x11ec, 0x001d, 0x0017, 0x0018];
const CHROME_SIGALGS: &[u16] = &[
  0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
];

/// Chrome shuffles its extensions on every connection; this is the fixed
/// order BoringSSL writes them in without permutation. ALPS is not sent, so
/// 131 and 133 share one hello.
const CHROME_EXTENSIONS: &[Extension] = &[
  Extension::Grease,
  Extension::ServerName,
  Extension::EncryptedClientHello,
  Extension::ExtendedMasterSecret,
  Extension::RenegotiationInfo,
  Extension::SupportedGroups,
  Extension::EcPointFormats(&[0]),
  Extension::SessionTicket,
  Extension::Alpn,
  Extension::StatusRequest,
  Extension::SignatureAlgorithms,
  Extension::SignedCertificateTimestamp,
  Extension::KeyShare(&[GREASE, 0x11ec, 0x001d]),
  Extension::PskKeyExchangeModes(&[1]),
  Extension::SupportedVersions(&[GREASE, 0x0304, 0x0303]),
  Extension::CompressCertificate(&[2]),
  Extension::Grease,
];

static CHROME_131: BrowserProfile = BrowserProfile {
  name: "chrome131",
  min_version: TlsVersion::Tls12,
  max_version: TlsVersion::Tls13,
  cipher_suites: CHROME_CIPHER_SUITES,
  extensions: CHROME_EXTENSIONS,
  supported_groups: CHROME_GROUPS,
  signature_algorithms: CHROME_SIGALGS,
  alpn: &["h2", "http/1.1"],
  compression_methods: &[0],
};

static CHROME_133: BrowserProfile = BrowserProfile {
  name: "chrome133",
  min_version: TlsVersion::Tls12,
  max_version: TlsVersion::Tls13,
  cipher_suites: CHROME_CIPHER_SUITES,
  extensions: CHROME_EXTENSIONS,
  supported_groups: CHROME_GROUPS,
  signature_algorithms: CHROME_SIGALGS,
  alpn: &["h2", "http/1.1"],
  compression_methods: &[0],
};

static FIREFOX_117: BrowserProfile = BrowserProfile {
  name: "firefox117",
  min_version: TlsVersion::Tls12,
  max_version: TlsVersion::Tls13,
  cipher_suites: &[
    0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc00a, 0xc009, 0xc013,
    0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
  ],
  extensions: &[
    Extension::ServerName,
    Extension::EncryptedClientHello,
    Extension::ExtendedMasterSecret,
    Extension::RenegotiationInfo,
    Extension::SupportedGroups,
    Extension::EcPointFormats(&[0]),
    Extension::SessionTicket,
    Extension::Alpn,
    Extension::StatusRequest,
    Extension::SignatureAlgorithms,
    Extension::KeyShare(&[0x001d]),
    Extension::PskKeyExchangeModes(&[1]),
    Extension::SupportedVersions(&[0x0304, 0x0303]),
  ],
  supported_groups: &[0x001d, 0x0017, 0x0018, 0x0019],
  signature_algorithms: &[
    0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601,
  ],
  alpn: &["h2", "http/1.1"],
  compression_methods: &[0],
};

static SAFARI_18_0: BrowserProfile = BrowserProfile {
  name: "safari18_0",
  min_version: TlsVersion::Tls10,
  max_version: TlsVersion::Tls13,
  cipher_suites: &[
    GREASE, 0x1301, 0x1302, 0x1303, 0xc02c, 0xc02b, 0xcca9, 0xc030, 0xc02f, 0xcca8, 0xc00a, 0xc009,
    0xc014, 0xc013, 0x009d, 0x009c, 0x0035, 0x002f,
  ],
  extensions: &[
    Extension::Grease,
    Extension::ServerName,
    Extension::ExtendedMasterSecret,
    Extension::RenegotiationInfo,
    Extension::SupportedGroups,
    Extension::EcPointFormats(&[0]),
    Extension::Alpn,
    Extension::StatusRequest,
    Extension::SignatureAlgorithms,
    Extension::SignedCertificateTimestamp,
    Extension::KeyShare(&[GREASE, 0x001d]),
    Extension::PskKeyExchangeModes(&[1]),
    Extension::SupportedVersions(&[GREASE, 0x0304, 0x0303, 0x0302, 0x0301]),
    Extension::CompressCertificate(&[1]),
    Extension::Grease,
    Extension::Padding,
  ],
  supported_groups: &[GREASE, 0x001d, 0x0017, 0x0018, 0x0019],
  signature_algorithms: &[
    0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
  ],
  alpn: &["h2", "http/1.1"],
  compression_methods: &[0],
};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lookup_is_case_insensitive() {
    assert_eq!(BrowserProfile::lookup("Chrome133").unwrap().name, "chrome133");
    assert_eq!(BrowserProfile::lookup("safari18_0").unwrap().name, "safari18_0");
  }

  #[test]
  fn unknown_profile_is_a_configuration_error() {
    let err = BrowserProfile::lookup("netscape4").unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("chrome133"));
  }

  #[test]
  fn names_cover_every_profile() {
    assert_eq!(
      BrowserProfile::names(),
      vec!["chrome131", "chrome133", "firefox117", "safari18_0"]
    );
  }

  #[test]
  fn chrome_releases_share_one_hello() {
    let old = BrowserProfile::lookup("chrome131").unwrap();
    let new = BrowserProfile::lookup("chrome133").unwrap();
    assert_eq!(old.extensions, new.extensions);
    assert_eq!(old.cipher_suites, new.cipher_suites);
    assert_eq!(old.supported_groups[1], 0x11ec);
  }

  #[test]
  fn cipher_suites_split_by_version() {
    let firefox = BrowserProfile::lookup("firefox117").unwrap();
    assert_eq!(
      firefox.tls13_cipher_suites().collect::<Vec<_>>(),
      vec![0x1301, 0x1302, 0x1303]
    );
    assert_eq!(firefox.tls12_cipher_suites().next(), Some(0xc02b));
    assert!(!firefox.grease());
    assert!(BrowserProfile::lookup("chrome133").unwrap().grease());
  }

  #[test]
  fn ja3_string_skips_grease_and_padding() {
    let chrome = BrowserProfile::lookup("chrome131").unwrap();
    assert_eq!(
      chrome.ja3_string(),
      "771,\
       4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,\
       0-65037-23-65281-10-11-35-16-5-13-18-51-45-43-27,\
       4588-29-23-24,\
       0"
    );
    let safari = BrowserProfile::lookup("safari18_0").unwrap();
    assert!(safari.has_extension(21));
    assert!(!safari.ja3_string().contains("-21,"));
  }

  #[test]
  fn wire_extensions_drop_name_and_padding() {
    let safari = BrowserProfile::lookup("safari18_0").unwrap();
    assert_eq!(
      safari.wire_extensions(),
      vec![GREASE, 23, 65281, 10, 11, 16, 5, 13, 18, 51, 45, 43, 27, GREASE]
    );
    assert_eq!(safari.key_share_groups(), &[GREASE, 0x001d]);
  }

  #[test]
  fn every_profile_is_internally_consistent() {
    for name in BrowserProfile::names() {
      let profile = BrowserProfile::lookup(name).unwrap();
      assert!(profile.min_version <= profile.max_version, "{}", name);
      assert!(profile.has_extension(0), "{} lacks SNI", name);
      assert!(profile.has_extension(16), "{} lacks ALPN", name);
      assert_eq!(profile.compression_methods, &[0]);
      assert!(profile.tls12_cipher_suites().count() > 0);
    }
  }
}
