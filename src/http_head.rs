//! Proxy request heads: the request line and headers a client sends before
//! either a tunnel or a forwarded body.
use crate::errors::{Error, Result};
use http::uri::Authority;
use http::{Method, StatusCode, Version};
use std::fmt;
use std::net::Ipv6Addr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on request line plus headers
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Request line and headers, in the order received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
  pub method: Method,
  /// Request target exactly as sent
  pub target: String,
  pub version: Version,
  pub headers: Vec<(String, String)>,
}

impl RequestHead {
  /// Read one request head.
  ///
  /// Returns `Ok(None)` when the peer closes before sending anything. Bytes
  /// after the blank line stay in `reader`.
  pub async fn read<R>(reader: &mut R) -> Result<Option<RequestHead>>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut consumed = 0usize;
    let mut line = Vec::new();

    // Leading empty lines are tolerated (RFC 9112 section 2.2)
    let request_line = loop {
      line.clear();
      let n = reader.read_until(b'\n', &mut line).await?;
      if n == 0 {
        if consumed == 0 {
          return Ok(None);
        }
        return Err(Error::invalid_request("connection closed inside request head"));
      }
      consumed += n;
      if consumed > MAX_HEAD_SIZE {
        return Err(Error::invalid_request("request head too large"));
      }
      let trimmed = trim_line(&line);
      if !trimmed.is_empty() {
        break String::from_utf8_lossy(trimmed).into_owned();
      }
    };

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
      (Some(method), Some(target), Some(version), None) => (method, target, version),
      _ => {
        return Err(Error::invalid_request(format!(
          "invalid request line {:?}",
          request_line
        )))
      }
    };
    let method = Method::from_bytes(method.as_bytes())
      .map_err(|_| Error::invalid_request(format!("invalid method {:?}", method)))?;
    let version = match version {
      "HTTP/1.1" => Version::HTTP_11,
      "HTTP/1.0" => Version::HTTP_10,
      other => {
        return Err(Error::invalid_request(format!(
          "unsupported protocol version {:?}",
          other
        )))
      }
    };

    let mut headers = Vec::new();
    loop {
      line.clear();
      let n = reader.read_until(b'\n', &mut line).await?;
      if n == 0 {
        return Err(Error::invalid_request("connection closed inside request head"));
      }
      consumed += n;
      if consumed > MAX_HEAD_SIZE {
        return Err(Error::invalid_request("request head too large"));
      }
      let trimmed = trim_line(&line);
      if trimmed.is_empty() {
        break;
      }
      let text = String::from_utf8_lossy(trimmed);
      let (name, value) = text
        .split_once(':')
        .filter(|(name, _)| !name.is_empty() && !name.contains(char::is_whitespace))
        .ok_or_else(|| Error::invalid_request(format!("invalid header line {:?}", text)))?;
      headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok(Some(RequestHead {
      method,
      target: target.to_string(),
      version,
      headers,
    }))
  }

  /// First value of header `name`, case-insensitive
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Decide between tunnelling and forwarding.
  pub fn into_route(self) -> Result<Route> {
    if self.method == Method::CONNECT {
      let target = ConnectTarget::parse(&self.target)?;
      Ok(Route::Tunnel(target))
    } else {
      Ok(Route::Forward(self))
    }
  }
}

/// Send a bodiless HTTP/1.1 status line to a proxy client.
///
/// `200` is the bare CONNECT acknowledgment, any other status also closes
/// the connection.
pub async fn write_status<W>(writer: &mut W, status: StatusCode) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let reason = status.canonical_reason().unwrap_or("Unknown");
  let response = if status == StatusCode::OK {
    "HTTP/1.1 200 Connection Established\r\n\r\n".to_string()
  } else {
    format!(
      "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
      status.as_u16(),
      reason
    )
  };
  writer.write_all(response.as_bytes()).await?;
  writer.flush().await?;
  Ok(())
}

fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

/// What to do with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
  /// CONNECT: intercept the tunnel to this target
  Tunnel(ConnectTarget),
  /// Anything else: forward as plain HTTP
  Forward(RequestHead),
}

/// `host:port` from a CONNECT request. IPv6 hosts are stored without brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
  pub host: String,
  pub port: u16,
}

impl ConnectTarget {
  /// Parse an authority-form target; the port is required.
  pub fn parse(authority: &str) -> Result<ConnectTarget> {
    let invalid = |why: &str| Error::invalid_request(format!("invalid CONNECT target {:?}: {}", authority, why));
    if authority.contains('@') {
      return Err(invalid("user info is not allowed"));
    }
    let parsed: Authority = authority.parse().map_err(|_| invalid("not an authority"))?;
    let port = parsed.port_u16().ok_or_else(|| invalid("missing port"))?;
    if port == 0 {
      return Err(invalid("port 0"));
    }
    let host = parsed.host();
    let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
      Some(v6) => {
        v6.parse::<Ipv6Addr>().map_err(|_| invalid("bad IPv6 literal"))?;
        v6
      }
      None => host,
    };
    if host.is_empty() {
      return Err(invalid("missing host"));
    }
    Ok(ConnectTarget {
      host: host.to_ascii_lowercase(),
      port,
    })
  }
}

impl fmt::Display for ConnectTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}
