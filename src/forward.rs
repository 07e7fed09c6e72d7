//! Plain HTTP forwarding for non-CONNECT requests. No interception.
use crate::errors::{Error, Result};
use crate::http_head::{write_status, RequestHead};
use crate::relay::relay;
use crate::server::ProxyContext;
use crate::upstream::host_port;
use http::{StatusCode, Uri, Version};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Hop-by-hop headers dropped from forwarded requests
const DROPPED_HEADERS: &[&str] = &[
  "proxy-connection",
  "proxy-authorization",
  "connection",
  "keep-alive",
];

/// Forwards one absolute-form request and relays the origin's answer.
///
/// The forwarded request carries `Connection: close`, so the client
/// connection serves exactly one request.
pub struct PlainHttpHandler {
  ctx: Arc<ProxyContext>,
  cancel: CancellationToken,
}

impl PlainHttpHandler {
  /// New handler for one client connection
  pub fn new(ctx: Arc<ProxyContext>, cancel: CancellationToken) -> Self {
    PlainHttpHandler { ctx, cancel }
  }

  /// Forward `head`; any body still unread in `client` follows it verbatim.
  pub async fn handle<C>(&self, mut client: C, head: RequestHead) -> Result<()>
  where
    C: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let (host, port, request) = match prepare(&head) {
      Ok(prepared) => prepared,
      Err(e) => {
        let _ = write_status(&mut client, e.status_code()).await;
        return Err(e);
      }
    };
    tracing::debug!("{} {} via {}", head.method, head.target, host_port(&host, port));

    let mut origin = match self.ctx.dialer.dial(&host, port).await {
      Ok(stream) => stream,
      Err(e) => {
        let _ = write_status(&mut client, e.status_code()).await;
        return Err(e);
      }
    };
    if let Err(e) = origin.write_all(&request).await {
      let _ = write_status(&mut client, StatusCode::BAD_GATEWAY).await;
      return Err(Error::dial(host_port(&host, port), e.to_string()));
    }

    let stats = relay(client, origin, self.ctx.idle_timeout, &self.cancel).await?;
    tracing::debug!(
      "forwarded {} {}: {} bytes up, {} bytes down",
      head.method,
      head.target,
      stats.client_to_server,
      stats.server_to_client
    );
    Ok(())
  }
}

/// Origin host, port and the origin-form request bytes for `head`.
fn prepare(head: &RequestHead) -> Result<(String, u16, Vec<u8>)> {
  let uri: Uri = head
    .target
    .parse()
    .map_err(|_| Error::invalid_request(format!("invalid request target {:?}", head.target)))?;
  match uri.scheme_str() {
    Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
    _ => {
      return Err(Error::invalid_request(format!(
        "proxy requests need an absolute http:// target, got {:?}",
        head.target
      )))
    }
  }
  let authority = uri
    .authority()
    .ok_or_else(|| Error::invalid_request("request target has no host"))?;
  let host = authority.host();
  let host = host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host)
    .to_string();
  if host.is_empty() {
    return Err(Error::invalid_request("request target has no host"));
  }
  let port = authority.port_u16().unwrap_or(80);
  let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  let version = if head.version == Version::HTTP_10 {
    "HTTP/1.0"
  } else {
    "HTTP/1.1"
  };

  let mut request = format!("{} {} {}\r\n", head.method, path, version);
  if head.header("host").is_none() {
    request.push_str(&format!("Host: {}\r\n", authority.as_str()));
  }
  for (name, value) in &head.headers {
    if DROPPED_HEADERS.iter().any(|d| name.eq_ignore_ascii_case(d)) {
      continue;
    }
    request.push_str(&format!("{}: {}\r\n", name, value));
  }
  request.push_str("Connection: close\r\n\r\n");
  Ok((host, port, request.into_bytes()))
}
