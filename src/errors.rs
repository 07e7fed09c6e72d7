//! engine error
use http::StatusCode;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `mimic_mitm::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while running the proxy.
///
/// `Configuration` errors only happen at startup and terminate the process.
/// Every other variant is scoped to a single connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Bad flag value, bad upstream descriptor, partial CA material, unknown profile
  #[error("configuration error: {0}")]
  Configuration(String),
  /// Signing failure or a hostname that cannot be put in a SAN
  #[error("certificate error: {0}")]
  Certificate(String),
  /// Client-facing or outbound TLS handshake failure
  #[error("handshake error: {0}")]
  Handshake(String),
  /// Outbound connection could not be established
  #[error("dial {target} failed: {reason}")]
  Dial {
    /// host:port that was being dialed
    target: String,
    /// human readable cause
    reason: String,
    /// reply reported by the SOCKS5 upstream, if it answered
    reply: Option<ReplyError>,
    /// the deadline expired before the connection was ready
    timed_out: bool,
  },
  /// I/O failure while relaying an established tunnel
  #[error("relay error: {0}")]
  Relay(std::io::Error),
  /// The client sent something that is not a usable proxy request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// Error
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// SOCKS5 reply codes (RFC 1928 section 6).
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
  #[error("Succeeded")]
  Succeeded,
  #[error("General failure")]
  GeneralFailure,
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed,
  #[error("Network unreachable")]
  NetworkUnreachable,
  #[error("Host unreachable")]
  HostUnreachable,
  #[error("Connection refused")]
  ConnectionRefused,
  #[error("TTL expired")]
  TtlExpired,
  #[error("Command not supported")]
  CommandNotSupported,
  #[error("Address type not supported")]
  AddressTypeNotSupported,
  #[error("Unassigned reply code {0:#04x}")]
  Unassigned(u8),
}

impl ReplyError {
  /// Wire value of this reply.
  pub fn code(&self) -> u8 {
    match self {
      ReplyError::Succeeded => 0x00,
      ReplyError::GeneralFailure => 0x01,
      ReplyError::ConnectionNotAllowed => 0x02,
      ReplyError::NetworkUnreachable => 0x03,
      ReplyError::HostUnreachable => 0x04,
      ReplyError::ConnectionRefused => 0x05,
      ReplyError::TtlExpired => 0x06,
      ReplyError::CommandNotSupported => 0x07,
      ReplyError::AddressTypeNotSupported => 0x08,
      ReplyError::Unassigned(code) => *code,
    }
  }
}

impl From<u8> for ReplyError {
  fn from(value: u8) -> Self {
    match value {
      0x00 => ReplyError::Succeeded,
      0x01 => ReplyError::GeneralFailure,
      0x02 => ReplyError::ConnectionNotAllowed,
      0x03 => ReplyError::NetworkUnreachable,
      0x04 => ReplyError::HostUnreachable,
      0x05 => ReplyError::ConnectionRefused,
      0x06 => ReplyError::TtlExpired,
      0x07 => ReplyError::CommandNotSupported,
      0x08 => ReplyError::AddressTypeNotSupported,
      other => ReplyError::Unassigned(other),
    }
  }
}

impl Error {
  /// Create a configuration error and log it
  pub fn configuration(msg: impl Into<String>) -> Self {
    let error = Error::Configuration(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a handshake error and log it
  pub fn handshake(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a dial error and log it
  pub fn dial(target: impl Into<String>, reason: impl Into<String>) -> Self {
    let error = Error::Dial {
      target: target.into(),
      reason: reason.into(),
      reply: None,
      timed_out: false,
    };
    tracing::debug!("{}", error);
    error
  }

  /// Create a dial error carrying the upstream's SOCKS5 reply and log it
  pub fn dial_rejected(target: impl Into<String>, reply: ReplyError) -> Self {
    let error = Error::Dial {
      target: target.into(),
      reason: format!("upstream rejected CONNECT: {}", reply),
      reply: Some(reply),
      timed_out: false,
    };
    tracing::debug!("{}", error);
    error
  }

  /// Create a dial error for an expired deadline and log it
  pub fn dial_timeout(target: impl Into<String>, after: std::time::Duration) -> Self {
    let error = Error::Dial {
      target: target.into(),
      reason: format!("timed out after {:?}", after),
      reply: None,
      timed_out: true,
    };
    tracing::debug!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Startup errors end the process, everything else ends one connection.
  pub fn is_fatal(&self) -> bool {
    matches!(self, Error::Configuration(_))
  }

  /// Status line sent to a client whose request fails before the tunnel is acknowledged.
  pub fn status_code(&self) -> StatusCode {
    match self {
      Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
      Error::Dial {
        timed_out: true, ..
      } => StatusCode::GATEWAY_TIMEOUT,
      _ => StatusCode::BAD_GATEWAY,
    }
  }
}
