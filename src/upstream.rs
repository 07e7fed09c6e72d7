//! Outbound connection factory: direct TCP or through a SOCKS5 upstream.
use crate::errors::{Error, ReplyError, Result};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

/// A SOCKS5 upstream parsed from `host:port` or `host:port:user:pass`.
///
/// IPv6 hosts are written in brackets: `[::1]:1080`.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
  /// Upstream host name or IP literal
  pub host: String,
  /// Upstream port
  pub port: u16,
  /// RFC 1929 user name
  pub username: Option<String>,
  /// RFC 1929 password
  pub password: Option<String>,
}

impl UpstreamConfig {
  /// Parse an upstream descriptor. An empty descriptor means direct dialing.
  pub fn parse(descriptor: &str) -> Result<Option<Self>> {
    let descriptor = descriptor.trim();
    if descriptor.is_empty() {
      return Ok(None);
    }
    descriptor.parse().map(Some)
  }

  /// `host:port`, with brackets around IPv6 literals
  pub fn address(&self) -> String {
    host_port(&self.host, self.port)
  }
}

impl FromStr for UpstreamConfig {
  type Err = Error;

  fn from_str(descriptor: &str) -> Result<Self> {
    let invalid = || {
      Error::configuration(format!(
        "invalid upstream descriptor {:?}, expected host:port or host:port:user:pass",
        descriptor
      ))
    };
    let (host, rest) = match descriptor.strip_prefix('[') {
      Some(bracketed) => bracketed.split_once("]:").ok_or_else(invalid)?,
      None => descriptor.split_once(':').ok_or_else(invalid)?,
    };
    if host.is_empty() {
      return Err(invalid());
    }
    let parts: Vec<&str> = rest.splitn(3, ':').collect();
    let (port, credentials) = match parts.as_slice() {
      [port] => (*port, None),
      [port, user, pass] if !user.is_empty() => (*port, Some((*user, *pass))),
      _ => return Err(invalid()),
    };
    let port = port
      .parse::<u16>()
      .ok()
      .filter(|p| *p != 0)
      .ok_or_else(invalid)?;
    if let Some((user, pass)) = credentials {
      if user.len() > u8::MAX as usize || pass.len() > u8::MAX as usize {
        return Err(Error::configuration(
          "upstream user name and password are limited to 255 bytes",
        ));
      }
    }
    Ok(UpstreamConfig {
      host: host.to_string(),
      port,
      username: credentials.map(|(u, _)| u.to_string()),
      password: credentials.map(|(_, p)| p.to_string()),
    })
  }
}

impl fmt::Debug for UpstreamConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("UpstreamConfig")
      .field("host", &self.host)
      .field("port", &self.port)
      .field("username", &self.username)
      .field("password", &self.password.as_ref().map(|_| "***"))
      .finish()
  }
}

/// Opens raw byte streams to `host:port`, either directly or through SOCKS5.
///
/// The connect timeout covers the whole operation, including name resolution
/// and the SOCKS5 negotiation.
#[derive(Clone, Debug)]
pub struct UpstreamDialer {
  upstream: Option<UpstreamConfig>,
  connect_timeout: Duration,
}

impl UpstreamDialer {
  /// Dial through `upstream` when given, directly otherwise.
  pub fn new(upstream: Option<UpstreamConfig>, connect_timeout: Duration) -> Self {
    Self {
      upstream,
      connect_timeout,
    }
  }

  /// Dial every target directly.
  pub fn direct(connect_timeout: Duration) -> Self {
    Self::new(None, connect_timeout)
  }

  /// The configured SOCKS5 upstream, if any
  pub fn upstream(&self) -> Option<&UpstreamConfig> {
    self.upstream.as_ref()
  }

  /// Open a connection to `host:port`.
  pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
    let target = host_port(host, port);
    match tokio::time::timeout(self.connect_timeout, self.dial_inner(host, port, &target)).await {
      Ok(result) => result,
      Err(_) => Err(Error::dial_timeout(target, self.connect_timeout)),
    }
  }

  async fn dial_inner(&self, host: &str, port: u16, target: &str) -> Result<TcpStream> {
    match &self.upstream {
      None => connect_host(host, port)
        .await
        .map_err(|e| Error::dial(target, e.to_string())),
      Some(upstream) => {
        let mut stream = connect_host(&upstream.host, upstream.port)
          .await
          .map_err(|e| Error::dial(target, format!("upstream {}: {}", upstream.address(), e)))?;
        Socks5Handshake::new(upstream, target)
          .run(&mut stream, host, port)
          .await?;
        tracing::debug!("connected to {} via {}", target, upstream.address());
        Ok(stream)
      }
    }
  }
}

/// Resolve `host` and try each address in turn.
async fn connect_host(host: &str, port: u16) -> std::io::Result<TcpStream> {
  let mut last_error = None;
  for addr in tokio::net::lookup_host((host, port)).await? {
    match connect_with_addr(addr).await {
      Ok(stream) => return Ok(stream),
      Err(e) => {
        tracing::trace!("connect {} failed: {}", addr, e);
        last_error = Some(e);
      }
    }
  }
  Err(last_error.unwrap_or_else(|| {
    std::io::Error::new(
      std::io::ErrorKind::NotFound,
      format!("{} did not resolve to any address", host),
    )
  }))
}

async fn connect_with_addr(addr: SocketAddr) -> std::io::Result<TcpStream> {
  let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
  raw_socket.set_nonblocking(true)?;
  let socket = TcpSocket::from_std_stream(raw_socket.into());
  socket.set_nodelay(true)?;
  socket.set_keepalive(true)?;
  socket.connect(addr).await
}

pub(crate) fn host_port(host: &str, port: u16) -> String {
  if host.contains(':') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  }
}

#[derive(Debug, PartialEq, Clone)]
enum AuthenticationMethod {
  None,
  Password { username: String, password: String },
}

impl From<&AuthenticationMethod> for u8 {
  fn from(val: &AuthenticationMethod) -> Self {
    match val {
      AuthenticationMethod::None => consts::SOCKS5_AUTH_METHOD_NONE,
      AuthenticationMethod::Password { .. } => consts::SOCKS5_AUTH_METHOD_PASSWORD,
    }
  }
}

/// One SOCKS5 CONNECT negotiation (RFC 1928, RFC 1929).
struct Socks5Handshake<'a> {
  auth: Option<AuthenticationMethod>,
  target: &'a str,
}

impl<'a> Socks5Handshake<'a> {
  fn new(upstream: &UpstreamConfig, target: &'a str) -> Self {
    let auth = upstream
      .username
      .as_ref()
      .map(|username| AuthenticationMethod::Password {
        username: username.clone(),
        password: upstream.password.clone().unwrap_or_default(),
      });
    Self { auth, target }
  }

  async fn run<S>(&self, stream: &mut S, host: &str, port: u16) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    self.version_methods(stream).await?;
    let method = self.which_method_accepted(stream).await?;
    self.use_password_auth(stream, method).await?;
    self.request_header(stream, host, port).await?;
    self.read_request_reply(stream).await
  }

  fn io_error(&self, e: std::io::Error) -> Error {
    Error::dial(self.target, format!("SOCKS5 negotiation: {}", e))
  }

  /// VER | NMETHODS | METHODS
  async fn version_methods<S>(&self, stream: &mut S) -> Result<()>
  where
    S: AsyncWrite + Unpin,
  {
    let mut methods = vec![&AuthenticationMethod::None];
    if let Some(method) = &self.auth {
      methods.push(method);
    }
    let mut packet = vec![consts::SOCKS5_VERSION, methods.len() as u8];
    packet.extend(methods.into_iter().map(u8::from));
    stream
      .write_all(&packet)
      .await
      .map_err(|e| self.io_error(e))
  }

  /// VER | METHOD, 0xff means none of ours was acceptable
  async fn which_method_accepted<S>(&self, stream: &mut S) -> Result<AuthenticationMethod>
  where
    S: AsyncRead + Unpin,
  {
    let mut buf = [0u8; 2];
    stream
      .read_exact(&mut buf)
      .await
      .map_err(|e| self.io_error(e))?;
    let [version, method] = buf;
    if version != consts::SOCKS5_VERSION {
      return Err(Error::dial(
        self.target,
        format!("upstream speaks SOCKS version {}", version),
      ));
    }
    match (method, &self.auth) {
      (consts::SOCKS5_AUTH_METHOD_NONE, _) => Ok(AuthenticationMethod::None),
      (consts::SOCKS5_AUTH_METHOD_PASSWORD, Some(auth)) => Ok(auth.clone()),
      _ => Err(Error::dial(
        self.target,
        "upstream accepted none of the offered auth methods",
      )),
    }
  }

  /// VER(1) | ULEN | UNAME | PLEN | PASSWD, answered by VER | STATUS
  async fn use_password_auth<S>(&self, stream: &mut S, method: AuthenticationMethod) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    if let AuthenticationMethod::Password { username, password } = method {
      let user_bytes = username.as_bytes();
      let pass_bytes = password.as_bytes();

      let mut packet: Vec<u8> = vec![consts::SOCKS5_AUTH_VERSION, user_bytes.len() as u8];
      packet.extend(user_bytes);
      packet.push(pass_bytes.len() as u8);
      packet.extend(pass_bytes);

      stream
        .write_all(&packet)
        .await
        .map_err(|e| self.io_error(e))?;
      let mut buf = [0u8; 2];
      stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| self.io_error(e))?;
      let [_version, status] = buf;
      if status != consts::SOCKS5_REPLY_SUCCEEDED {
        return Err(Error::dial(
          self.target,
          format!("upstream rejected credentials for user `{}`", username),
        ));
      }
    }
    Ok(())
  }

  /// VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
  ///
  /// Names travel as the domain address type so the upstream resolves them.
  async fn request_header<S>(&self, stream: &mut S, host: &str, port: u16) -> Result<()>
  where
    S: AsyncWrite + Unpin,
  {
    let mut packet = vec![
      consts::SOCKS5_VERSION,
      consts::SOCKS5_CMD_TCP_CONNECT,
      0x00,
    ];
    match host.parse::<IpAddr>() {
      Ok(IpAddr::V4(ip)) => {
        packet.push(consts::SOCKS5_ADDR_TYPE_IPV4);
        packet.extend_from_slice(&ip.octets());
      }
      Ok(IpAddr::V6(ip)) => {
        packet.push(consts::SOCKS5_ADDR_TYPE_IPV6);
        packet.extend_from_slice(&ip.octets());
      }
      Err(_) => {
        if host.is_empty() || host.len() > u8::MAX as usize {
          return Err(Error::dial(self.target, "domain name length out of range"));
        }
        packet.push(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
        packet.push(host.len() as u8);
        packet.extend_from_slice(host.as_bytes());
      }
    }
    packet.extend_from_slice(&port.to_be_bytes());
    stream
      .write_all(&packet)
      .await
      .map_err(|e| self.io_error(e))?;
    stream.flush().await.map_err(|e| self.io_error(e))
  }

  /// VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
  async fn read_request_reply<S>(&self, stream: &mut S) -> Result<()>
  where
    S: AsyncRead + Unpin,
  {
    let mut buf = [0u8; 4];
    stream
      .read_exact(&mut buf)
      .await
      .map_err(|e| self.io_error(e))?;
    let [version, reply, _rsv, address_type] = buf;
    if version != consts::SOCKS5_VERSION {
      return Err(Error::dial(
        self.target,
        format!("upstream replied with SOCKS version {}", version),
      ));
    }
    if reply != consts::SOCKS5_REPLY_SUCCEEDED {
      return Err(Error::dial_rejected(self.target, ReplyError::from(reply)));
    }
    // The bound address is of no use to us, but it has to leave the stream.
    let address_len = match address_type {
      consts::SOCKS5_ADDR_TYPE_IPV4 => 4,
      consts::SOCKS5_ADDR_TYPE_IPV6 => 16,
      consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
        let mut len = [0u8];
        stream
          .read_exact(&mut len)
          .await
          .map_err(|e| self.io_error(e))?;
        len[0] as usize
      }
      other => {
        return Err(Error::dial(
          self.target,
          format!("upstream replied with address type {}", other),
        ))
      }
    };
    let mut bound = vec![0u8; address_len + 2];
    stream
      .read_exact(&mut bound)
      .await
      .map_err(|e| self.io_error(e))?;
    Ok(())
  }
}

#[rustfmt::skip]
mod consts {
  pub const SOCKS5_VERSION: u8 = 0x05;
  pub const SOCKS5_AUTH_VERSION: u8 = 0x01;

  pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
  pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;

  pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;

  pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

  pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_descriptor_with_credentials() {
    let upstream = UpstreamConfig::parse("proxy.example:1080:alice:secret")
      .unwrap()
      .unwrap();
    assert_eq!(upstream.host, "proxy.example");
    assert_eq!(upstream.port, 1080);
    assert_eq!(upstream.username.as_deref(), Some("alice"));
    assert_eq!(upstream.password.as_deref(), Some("secret"));
  }

  #[test]
  fn parses_descriptor_without_credentials() {
    let upstream = UpstreamConfig::parse("proxy.example:1080").unwrap().unwrap();
    assert_eq!(upstream.address(), "proxy.example:1080");
    assert!(upstream.username.is_none());
    assert!(upstream.password.is_none());
  }

  #[test]
  fn parses_bracketed_ipv6_host() {
    let upstream = UpstreamConfig::parse("[::1]:1080:bob:pw").unwrap().unwrap();
    assert_eq!(upstream.host, "::1");
    assert_eq!(upstream.address(), "[::1]:1080");
  }

  #[test]
  fn empty_descriptor_means_direct() {
    assert!(UpstreamConfig::parse("").unwrap().is_none());
    assert!(UpstreamConfig::parse("   ").unwrap().is_none());
  }

  #[test]
  fn rejects_malformed_descriptors() {
    for bad in [
      "not-a-valid-descriptor",
      "proxy.example:",
      "proxy.example:http",
      "proxy.example:0",
      "proxy.example:1080:alice",
      ":1080",
      "proxy.example:1080::secret",
    ] {
      let err = UpstreamConfig::parse(bad).unwrap_err();
      assert!(err.is_fatal(), "{} should be a configuration error", bad);
    }
  }

  #[test]
  fn debug_output_hides_password() {
    let upstream = UpstreamConfig::parse("p:1:u:hunter2").unwrap().unwrap();
    assert!(!format!("{:?}", upstream).contains("hunter2"));
  }

  #[tokio::test]
  async fn domain_targets_use_domain_address_type() {
    let upstream = UpstreamConfig::parse("p:1080").unwrap().unwrap();
    let handshake = Socks5Handshake::new(&upstream, "example.com:443");
    let mut written = Vec::new();
    handshake
      .request_header(&mut written, "example.com", 443)
      .await
      .unwrap();
    let mut expected = vec![0x05, 0x01, 0x00, 0x03, 11];
    expected.extend_from_slice(b"example.com");
    expected.extend_from_slice(&443u16.to_be_bytes());
    assert_eq!(written, expected);
  }

  #[tokio::test]
  async fn ipv6_targets_use_ipv6_address_type() {
    let upstream = UpstreamConfig::parse("p:1080").unwrap().unwrap();
    let handshake = Socks5Handshake::new(&upstream, "[::1]:8443");
    let mut written = Vec::new();
    handshake
      .request_header(&mut written, "::1", 8443)
      .await
      .unwrap();
    assert_eq!(written[3], 0x04);
    assert_eq!(written.len(), 4 + 16 + 2);
  }
}
