use super::{is_grease, join_decimal, normalize_grease};
use crate::errors::{Error, Result};
use tls_parser::{
  parse_tls_extensions, parse_tls_plaintext, SNIType, TlsClientHelloContents, TlsExtension,
  TlsExtensionType, TlsMessage, TlsMessageHandshake, TlsRecordType,
};

const EXT_SERVER_NAME: u16 = 0;
const EXT_PADDING: u16 = 21;

/// A parsed TLS Client Hello. Lists keep wire order and raw GREASE values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
  pub record_version: u16,
  pub legacy_version: u16,
  pub cipher_suites: Vec<u16>,
  pub compression_methods: Vec<u8>,
  /// Extension types in the order they were sent
  pub extensions: Vec<u16>,
  pub server_name: Option<String>,
  pub alpn_protocols: Vec<Vec<u8>>,
  pub supported_groups: Vec<u16>,
  pub signature_algorithms: Vec<u16>,
  pub supported_versions: Vec<u16>,
  pub ec_point_formats: Vec<u8>,
  pub key_share_groups: Vec<u16>,
}

/// The destination-independent part of a Client Hello.
///
/// GREASE values are normalised and the SNI and padding extensions are left
/// out, both vary with the hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloShape {
  pub legacy_version: u16,
  pub cipher_suites: Vec<u16>,
  pub compression_methods: Vec<u8>,
  pub extensions: Vec<u16>,
  pub supported_groups: Vec<u16>,
  pub signature_algorithms: Vec<u16>,
  pub alpn_protocols: Vec<Vec<u8>>,
  pub supported_versions: Vec<u16>,
  pub ec_point_formats: Vec<u8>,
  pub key_share_groups: Vec<u16>,
}

impl ClientHello {
  /// Parse a TLS plaintext record carrying a Client Hello.
  ///
  /// The whole hello must be inside this one record.
  pub fn parse(record: &[u8]) -> Result<ClientHello> {
    let (_, plaintext) =
      parse_tls_plaintext(record).map_err(|e| malformed(format!("{:?}", e)))?;
    if plaintext.hdr.record_type != TlsRecordType::Handshake {
      return Err(malformed(format!(
        "not a handshake record ({:?})",
        plaintext.hdr.record_type
      )));
    }
    let contents = match plaintext.msg.first() {
      Some(TlsMessage::Handshake(TlsMessageHandshake::ClientHello(contents))) => contents,
      _ => return Err(malformed("first handshake message is not a Client Hello")),
    };

    let mut hello = ClientHello {
      record_version: plaintext.hdr.version.0,
      ..ClientHello::from(contents)
    };
    if let Some(raw) = contents.ext {
      let (rest, extensions) =
        parse_tls_extensions(raw).map_err(|e| malformed(format!("extensions: {:?}", e)))?;
      if !rest.is_empty() {
        return Err(malformed(format!(
          "{} bytes of extensions could not be parsed",
          rest.len()
        )));
      }
      for extension in &extensions {
        hello.add_extension(extension)?;
      }
    }
    Ok(hello)
  }

  fn add_extension(&mut self, extension: &TlsExtension<'_>) -> Result<()> {
    let code = match extension {
      TlsExtension::Grease(code, _) => *code,
      other => TlsExtensionType::from(other).0,
    };
    self.extensions.push(code);
    match extension {
      TlsExtension::SNI(names) => {
        if self.server_name.is_none() {
          self.server_name = names
            .iter()
            .find(|(kind, _)| *kind == SNIType::HostName)
            .map(|(_, name)| String::from_utf8_lossy(name).into_owned());
        }
      }
      TlsExtension::EllipticCurves(groups) => {
        self.supported_groups = groups.iter().map(|g| g.0).collect();
      }
      TlsExtension::EcPointFormats(formats) => self.ec_point_formats = formats.to_vec(),
      TlsExtension::SignatureAlgorithms(algs) => self.signature_algorithms = algs.clone(),
      TlsExtension::ALPN(protocols) => {
        self.alpn_protocols = protocols.iter().map(|p| p.to_vec()).collect();
      }
      TlsExtension::SupportedVersions(versions) => {
        self.supported_versions = versions.iter().map(|v| v.0).collect();
      }
      TlsExtension::KeyShare(raw) => self.key_share_groups = key_share_groups(raw)?,
      _ => {}
    }
    Ok(())
  }

  /// Structural fingerprint, equal for two hellos from the same client
  /// configuration whatever the destination.
  pub fn shape(&self) -> HelloShape {
    let normalize =
      |values: &[u16]| -> Vec<u16> { values.iter().copied().map(normalize_grease).collect() };
    HelloShape {
      legacy_version: self.legacy_version,
      cipher_suites: normalize(&self.cipher_suites),
      compression_methods: self.compression_methods.clone(),
      extensions: self
        .extensions
        .iter()
        .copied()
        .filter(|e| *e != EXT_SERVER_NAME && *e != EXT_PADDING)
        .map(normalize_grease)
        .collect(),
      supported_groups: normalize(&self.supported_groups),
      signature_algorithms: normalize(&self.signature_algorithms),
      alpn_protocols: self.alpn_protocols.clone(),
      supported_versions: normalize(&self.supported_versions),
      ec_point_formats: self.ec_point_formats.clone(),
      key_share_groups: normalize(&self.key_share_groups),
    }
  }

  /// JA3 string: `version,ciphers,extensions,groups,point_formats`, GREASE removed.
  pub fn ja3_string(&self) -> String {
    let no_grease = |values: &[u16]| {
      join_decimal(values.iter().copied().filter(|v| !is_grease(*v)).collect::<Vec<_>>())
    };
    format!(
      "{},{},{},{},{}",
      self.legacy_version,
      no_grease(&self.cipher_suites),
      no_grease(&self.extensions),
      no_grease(&self.supported_groups),
      join_decimal(&self.ec_point_formats),
    )
  }
}

impl From<&TlsClientHelloContents<'_>> for ClientHello {
  fn from(contents: &TlsClientHelloContents<'_>) -> Self {
    ClientHello {
      legacy_version: contents.version.0,
      cipher_suites: contents.ciphers.iter().map(|c| c.0).collect(),
      compression_methods: contents.comp.iter().map(|c| c.0).collect(),
      ..Default::default()
    }
  }
}

/// Groups of a client `key_share` body: a 16-bit length, then
/// `group(2) length(2) key` entries. The key bytes are skipped.
fn key_share_groups(raw: &[u8]) -> Result<Vec<u16>> {
  let truncated = || malformed("truncated key_share");
  let (len, mut entries) = raw.split_first_chunk::<2>().ok_or_else(truncated)?;
  if entries.len() != u16::from_be_bytes(*len) as usize {
    return Err(malformed("key_share length mismatch"));
  }
  let mut groups = Vec::new();
  while !entries.is_empty() {
    let (head, rest) = entries.split_first_chunk::<4>().ok_or_else(truncated)?;
    let key_len = u16::from_be_bytes([head[2], head[3]]) as usize;
    if rest.len() < key_len {
      return Err(truncated());
    }
    groups.push(u16::from_be_bytes([head[0], head[1]]));
    entries = &rest[key_len..];
  }
  Ok(groups)
}

fn malformed(msg: impl Into<String>) -> Error {
  Error::handshake(format!("malformed Client Hello: {}", msg.into()))
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Builds a Client Hello record the way a client would put it on the wire.
  fn build_hello(server_name: &str, grease: u16, padding: usize) -> Vec<u8> {
    let mut extensions = Vec::new();
    let mut push_ext = |ext_type: u16, data: &[u8]| {
      extensions.extend_from_slice(&ext_type.to_be_bytes());
      extensions.extend_from_slice(&(data.len() as u16).to_be_bytes());
      extensions.extend_from_slice(data);
    };
    push_ext(grease, &[]);
    let mut sni = Vec::new();
    sni.extend_from_slice(&((server_name.len() + 3) as u16).to_be_bytes());
    sni.push(0);
    sni.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
    sni.extend_from_slice(server_name.as_bytes());
    push_ext(0, &sni);
    push_ext(10, &[0x00, 0x06, (grease >> 8) as u8, grease as u8, 0x00, 0x1d, 0x00, 0x17]);
    push_ext(11, &[0x01, 0x00]);
    push_ext(13, &[0x00, 0x04, 0x04, 0x03, 0x08, 0x04]);
    push_ext(16, &[0x00, 0x0c, 0x02, b'h', b'2', 0x08, b'h', b't', b't', b'p', b'/', b'1', b'.', b'1']);
    push_ext(43, &[0x04, 0x03, 0x04, 0x03, 0x03]);
    push_ext(51, &[0x00, 0x06, 0x00, 0x1d, 0x00, 0x02, 0xaa, 0xbb]);
    push_ext(21, &vec![0u8; padding]);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x11; 32]);
    body.push(32);
    body.extend_from_slice(&[0x22; 32]);
    let ciphers = [grease, 0x1301, 0xc02b, 0x002f];
    body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
    for cipher in ciphers {
      body.extend_from_slice(&cipher.to_be_bytes());
    }
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
  }

  #[test]
  fn parses_every_field() {
    let hello = ClientHello::parse(&build_hello("example.com", 0x3a3a, 10)).unwrap();
    assert_eq!(hello.record_version, 0x0301);
    assert_eq!(hello.legacy_version, 0x0303);
    assert_eq!(hello.cipher_suites, vec![0x3a3a, 0x1301, 0xc02b, 0x002f]);
    assert_eq!(hello.compression_methods, vec![0]);
    assert_eq!(hello.extensions, vec![0x3a3a, 0, 10, 11, 13, 16, 43, 51, 21]);
    assert_eq!(hello.server_name.as_deref(), Some("example.com"));
    assert_eq!(hello.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    assert_eq!(hello.supported_groups, vec![0x3a3a, 0x001d, 0x0017]);
    assert_eq!(hello.signature_algorithms, vec![0x0403, 0x0804]);
    assert_eq!(hello.supported_versions, vec![0x0304, 0x0303]);
    assert_eq!(hello.ec_point_formats, vec![0]);
    assert_eq!(hello.key_share_groups, vec![0x001d]);
  }

  #[test]
  fn shape_ignores_destination_and_grease() {
    let a = ClientHello::parse(&build_hello("example.com", 0x3a3a, 10)).unwrap();
    let b = ClientHello::parse(&build_hello("a.much.longer.example.org", 0xdada, 3)).unwrap();
    assert_ne!(a.server_name, b.server_name);
    assert_eq!(a.shape(), b.shape());
    assert_eq!(a.ja3_string(), b.ja3_string());
    assert_eq!(a.ja3_string(), "771,4865-49195-47,0-10-11-13-16-43-51-21,29-23,0");
  }

  #[test]
  fn rejects_truncated_and_foreign_records() {
    let record = build_hello("example.com", 0x0a0a, 0);
    assert!(ClientHello::parse(&record[..record.len() - 1]).is_err());
    assert!(ClientHello::parse(&record[..3]).is_err());
    let mut alert = record.clone();
    alert[0] = 0x15;
    assert!(ClientHello::parse(&alert).is_err());
    assert!(ClientHello::parse(b"CONNECT example.com:443 HTTP/1.1\r\n").is_err());
  }
}
