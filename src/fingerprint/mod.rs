//! Browser Client Hello fingerprints
//!
//! A [`BrowserProfile`] describes the exact Client Hello a browser sends:
//! cipher suites, extensions, groups, signature algorithms, ALPN and
//! compression methods, each in wire order. [`ClientHello`] parses a captured
//! hello back into the same terms so the two can be compared.
mod client_hello;
mod profiles;

pub use client_hello::{ClientHello, HelloShape};
pub use profiles::{BrowserProfile, Extension, TlsVersion};

/// Placeholder used in profile tables wherever a browser sends a GREASE value.
pub const GREASE: u16 = 0x0a0a;

/// RFC 8701 reserved values: `0x?a?a` with both bytes equal.
pub fn is_grease(value: u16) -> bool {
  value & 0x0f0f == 0x0a0a && value >> 8 == value & 0xff
}

/// Replace any GREASE value with [`GREASE`] so randomized values compare equal.
pub fn normalize_grease(value: u16) -> u16 {
  if is_grease(value) {
    GREASE
  } else {
    value
  }
}

pub(crate) fn join_decimal<T: ToString>(values: impl IntoIterator<Item = T>) -> String {
  values
    .into_iter()
    .map(|v| v.to_string())
    .collect::<Vec<_>>()
    .join("-")
}
