//! Proxy configuration
use crate::errors::{Error, Result};
use crate::upstream::UpstreamConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the intercepting proxy
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// CA certificate PEM, created on first start when missing
  pub ca_cert_path: PathBuf,
  /// CA private key PEM, created on first start when missing
  pub ca_key_path: PathBuf,
  /// Listen host, empty means all interfaces
  pub listen_host: String,
  /// Listen port
  pub listen_port: u16,
  /// Browser whose Client Hello the outbound leg reproduces
  pub browser_profile: String,
  /// SOCKS5 upstream, `None` dials directly
  pub upstream: Option<UpstreamConfig>,
  /// Log at debug level unless `RUST_LOG` says otherwise
  pub debug: bool,
  /// Bound on a single outbound dial, SOCKS5 negotiation included
  pub connect_timeout: Duration,
  /// Bound on each TLS handshake (client-facing and outbound)
  pub handshake_timeout: Duration,
  /// A relay with no traffic in either direction for this long is closed
  pub idle_timeout: Duration,
  /// Verify origin certificates against the system trust store
  pub verify_upstream: bool,
  /// Append TLS secrets here in NSS key-log format
  pub key_log_path: Option<PathBuf>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      ca_cert_path: PathBuf::from("cert.pem"),
      ca_key_path: PathBuf::from("key.pem"),
      listen_host: String::new(),
      listen_port: 8080,
      browser_profile: "chrome133".to_string(),
      upstream: None,
      debug: false,
      connect_timeout: Duration::from_secs(10),
      handshake_timeout: Duration::from_secs(15),
      idle_timeout: Duration::from_secs(300),
      verify_upstream: true,
      key_log_path: None,
    }
  }
}

impl ProxyConfig {
  /// The socket address to bind. Only IP literals are accepted as host.
  pub fn listen_address(&self) -> Result<SocketAddr> {
    let host = self.listen_host.trim();
    let host = host
      .strip_prefix('[')
      .and_then(|h| h.strip_suffix(']'))
      .unwrap_or(host);
    let ip = if host.is_empty() {
      IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else if host.eq_ignore_ascii_case("localhost") {
      IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
      host
        .parse::<IpAddr>()
        .map_err(|_| Error::configuration(format!("invalid listen address {:?}", self.listen_host)))?
    };
    Ok(SocketAddr::new(ip, self.listen_port))
  }

  /// Default `tracing` directive for this crate, used when `RUST_LOG` is unset.
  pub fn log_directive(&self) -> &'static str {
    if self.debug {
      "mimic_mitm=debug"
    } else {
      "mimic_mitm=info"
    }
  }
}
