//! CONNECT interception
//!
//! A session moves through [`TunnelState`] in a fixed order: the origin is
//! dialed before the client is told anything, so a failed dial can still be
//! reported as an HTTP status. After the `200` the client's Client Hello is
//! read, a leaf is issued for its SNI, the emulated handshake with the origin
//! runs, and only then is the client's handshake completed, agreeing on the
//! protocol the origin picked.
use crate::errors::{Error, Result};
use crate::fingerprint::ClientHello;
use crate::http_head::{write_status, ConnectTarget};
use crate::relay::relay;
use crate::server::ProxyContext;
use bytes::{Buf, Bytes};
use http::StatusCode;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_rustls::rustls::KeyLog as RustlsKeyLog;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const MAX_RECORD_LEN: usize = 16 * 1024 + 256;

/// Where a session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
  AwaitingConnect,
  OutboundDialed,
  Accepted,
  ClientTlsEstablished,
  Relaying,
  Closed,
}

impl fmt::Display for TunnelState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      TunnelState::AwaitingConnect => "awaiting-connect",
      TunnelState::OutboundDialed => "outbound-dialed",
      TunnelState::Accepted => "accepted",
      TunnelState::ClientTlsEstablished => "client-tls-established",
      TunnelState::Relaying => "relaying",
      TunnelState::Closed => "closed",
    };
    f.write_str(name)
  }
}

/// Drives one CONNECT session.
pub struct TunnelHandler {
  ctx: Arc<ProxyContext>,
  cancel: CancellationToken,
  state: TunnelState,
}

impl TunnelHandler {
  /// `cancel` ends the session when fired, it is usually a child of the
  /// server's shutdown token.
  pub fn new(ctx: Arc<ProxyContext>, cancel: CancellationToken) -> Self {
    TunnelHandler {
      ctx,
      cancel,
      state: TunnelState::AwaitingConnect,
    }
  }

  /// Current state
  pub fn state(&self) -> TunnelState {
    self.state
  }

  fn enter(&mut self, state: TunnelState) {
    tracing::debug!("tunnel {} -> {}", self.state, state);
    self.state = state;
  }

  /// Run the session for an already parsed CONNECT request to `target`.
  pub async fn handle<C>(&mut self, client: C, target: ConnectTarget) -> Result<()>
  where
    C: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let result = self.run(client, &target).await;
    if let Err(e) = &result {
      tracing::debug!("tunnel to {} ended in {}: {}", target, self.state, e);
    }
    self.enter(TunnelState::Closed);
    result
  }

  async fn run<C>(&mut self, mut client: C, target: &ConnectTarget) -> Result<()>
  where
    C: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let outbound = match self.ctx.dialer.dial(&target.host, target.port).await {
      Ok(stream) => stream,
      Err(e) => {
        let _ = write_status(&mut client, e.status_code()).await;
        return Err(e);
      }
    };
    self.enter(TunnelState::OutboundDialed);

    write_status(&mut client, StatusCode::OK).await?;
    self.enter(TunnelState::Accepted);

    let handshake_timeout = self.ctx.handshake_timeout;
    let first = match tokio::time::timeout(handshake_timeout, read_first_record(&mut client)).await {
      Ok(first) => first?,
      // Server-speaks-first protocols send nothing, pass them through.
      Err(_) => FirstRecord::Other(Bytes::new()),
    };
    let (record, hello) = match first {
      FirstRecord::Tls(record) => {
        let hello = ClientHello::parse(&record)
          .map_err(|e| tracing::debug!("client hello not understood, using CONNECT host: {}", e))
          .ok();
        (record, hello)
      }
      FirstRecord::Other(prefix) => {
        tracing::debug!("{} is not TLS, relaying without interception", target);
        let client = Rewind::new(prefix, client);
        self.enter(TunnelState::Relaying);
        let stats = relay(client, outbound, self.ctx.idle_timeout, &self.cancel).await?;
        tracing::debug!("raw tunnel to {} done: {:?}", target, stats);
        return Ok(());
      }
    };
    if let Some(hello) = &hello {
      tracing::debug!(
        "client hello sni={:?} alpn={:?} ja3={}",
        hello.server_name,
        hello
          .alpn_protocols
          .iter()
          .map(|p| String::from_utf8_lossy(p).into_owned())
          .collect::<Vec<_>>(),
        hello.ja3_string()
      );
    }

    let sni = hello
      .as_ref()
      .and_then(|h| h.server_name.clone())
      .filter(|name| !name.is_empty());
    let leaf_host = sni.as_deref().unwrap_or(&target.host);
    let leaf = self.ctx.certs.get_or_issue(leaf_host).await?;

    // The origin is addressed by name whenever the client gave us one.
    let origin_name = match (target.host.parse::<IpAddr>(), &sni) {
      (Ok(_), Some(name)) => name.as_str(),
      _ => target.host.as_str(),
    };
    let alpn_offer = hello
      .as_ref()
      .and_then(|h| self.ctx.emulator.alpn_for_client(&h.alpn_protocols));
    let upstream = self
      .ctx
      .emulator
      .connect_with_alpn(origin_name, outbound, alpn_offer.as_deref())
      .await?;
    let selected_alpn = upstream.alpn().map(|p| p.to_vec());
    tracing::debug!(
      "origin {} negotiated {} alpn={:?}",
      origin_name,
      upstream.version(),
      selected_alpn
        .as_deref()
        .map(String::from_utf8_lossy)
    );

    let server_config = leaf.server_config(
      selected_alpn.as_deref(),
      self.ctx.key_log.clone().map(|k| k as Arc<dyn RustlsKeyLog>),
    )?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let client = Rewind::new(record, client);
    let client_tls = tokio::time::timeout(handshake_timeout, acceptor.accept(client))
      .await
      .map_err(|_| Error::handshake(format!("client handshake for {} timed out", leaf_host)))?
      .map_err(|e| Error::handshake(format!("client handshake for {} failed: {}", leaf_host, e)))?;
    self.enter(TunnelState::ClientTlsEstablished);

    self.enter(TunnelState::Relaying);
    let stats = relay(client_tls, upstream, self.ctx.idle_timeout, &self.cancel).await?;
    tracing::debug!(
      "tunnel to {} done: {} bytes up, {} bytes down, {:?}",
      target,
      stats.client_to_server,
      stats.server_to_client,
      stats.end
    );
    Ok(())
  }
}

enum FirstRecord {
  /// A complete handshake record
  Tls(Bytes),
  /// Whatever arrived, when it does not start a TLS handshake
  Other(Bytes),
}

async fn read_first_record<R>(reader: &mut R) -> Result<FirstRecord>
where
  R: AsyncRead + Unpin,
{
  let mut header = [0u8; 5];
  reader.read_exact(&mut header[..1]).await?;
  if header[0] != CONTENT_TYPE_HANDSHAKE {
    return Ok(FirstRecord::Other(Bytes::copy_from_slice(&header[..1])));
  }
  reader.read_exact(&mut header[1..]).await?;
  let len = u16::from_be_bytes([header[3], header[4]]) as usize;
  if len > MAX_RECORD_LEN {
    return Err(Error::handshake(format!("client record of {} bytes", len)));
  }
  let mut record = Vec::with_capacity(5 + len);
  record.extend_from_slice(&header);
  record.resize(5 + len, 0);
  reader.read_exact(&mut record[5..]).await?;
  Ok(FirstRecord::Tls(Bytes::from(record)))
}

/// A stream that replays `prefix` before reading from `inner`.
struct Rewind<S> {
  prefix: Bytes,
  inner: S,
}

impl<S> Rewind<S> {
  fn new(prefix: Bytes, inner: S) -> Self {
    Rewind { prefix, inner }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    if self.prefix.has_remaining() {
      let n = self.prefix.len().min(buf.remaining());
      buf.put_slice(&self.prefix[..n]);
      self.prefix.advance(n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
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

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn rewind_replays_prefix_first() {
    let inner: &[u8] = b" world";
    let mut stream = Rewind::new(Bytes::from_static(b"hello"), inner);
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "hello world");
  }

  #[tokio::test]
  async fn first_record_is_read_whole() {
    let input: &[u8] = &[0x16, 0x03, 0x01, 0x00, 0x03, 0xaa, 0xbb, 0xcc, 0xdd];
    let mut reader = input;
    match read_first_record(&mut reader).await.unwrap() {
      FirstRecord::Tls(record) => assert_eq!(&record[..], &input[..8]),
      FirstRecord::Other(_) => panic!("expected a TLS record"),
    }
    assert_eq!(reader, &[0xdd]);
  }

  #[tokio::test]
  async fn non_tls_first_byte_is_kept() {
    let mut reader: &[u8] = b"GET / HTTP/1.1\r\n";
    match read_first_record(&mut reader).await.unwrap() {
      FirstRecord::Other(prefix) => assert_eq!(&prefix[..], b"G"),
      FirstRecord::Tls(_) => panic!("plain HTTP is not TLS"),
    }
  }

  #[test]
  fn states_render_for_logs() {
    assert_eq!(TunnelState::ClientTlsEstablished.to_string(), "client-tls-established");
  }
}
