//! Proxy server: accept loop and per-connection dispatch.
use crate::ca::{CertificateAuthority, CertificateManager};
use crate::config::ProxyConfig;
use crate::emulator::{EmulatorOptions, TlsEmulator};
use crate::errors::{Error, Result};
use crate::fingerprint::BrowserProfile;
use crate::forward::PlainHttpHandler;
use crate::http_head::{write_status, RequestHead, Route};
use crate::session::{KeyLog, SessionKey};
use crate::tunnel::TunnelHandler;
use crate::upstream::UpstreamDialer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Everything a connection task needs, built once at startup and shared.
pub struct ProxyContext {
  /// Root CA and leaf cache
  pub certs: CertificateManager,
  /// Outbound handshakes
  pub emulator: TlsEmulator,
  /// Outbound connections
  pub dialer: UpstreamDialer,
  /// Bound on reading the request head and on each TLS handshake
  pub handshake_timeout: Duration,
  /// Relay idle timeout
  pub idle_timeout: Duration,
  /// Shared by the client-facing and outbound TLS legs
  pub key_log: Option<Arc<KeyLog>>,
  /// Process-wide random master value
  pub session_key: SessionKey,
}

impl ProxyContext {
  /// Context with default timeouts and no key log.
  pub fn new(certs: CertificateManager, emulator: TlsEmulator, dialer: UpstreamDialer) -> Self {
    let defaults = ProxyConfig::default();
    ProxyContext {
      certs,
      emulator,
      dialer,
      handshake_timeout: defaults.handshake_timeout,
      idle_timeout: defaults.idle_timeout,
      key_log: None,
      session_key: SessionKey::generate(),
    }
  }

  /// Load the CA, select the profile and build the emulator and dialer.
  ///
  /// Every failure here is a configuration error.
  pub async fn from_config(config: &ProxyConfig) -> Result<Self> {
    let session_key = SessionKey::generate();
    tracing::debug!("session {}", session_key.id());
    let key_log = config
      .key_log_path
      .as_ref()
      .map(|path| KeyLog::open(path, &session_key))
      .transpose()?
      .map(Arc::new);

    let ca = CertificateAuthority::load_or_generate(&config.ca_cert_path, &config.ca_key_path)
      .await
      .map_err(|e| match e {
        Error::Io(io) => Error::configuration(format!("CA material: {}", io)),
        other => other,
      })?;
    tracing::info!(
      "using CA {}, install it in clients to trust intercepted connections",
      ca.ca_cert_path().display()
    );

    let profile = BrowserProfile::lookup(&config.browser_profile)?;
    let emulator = TlsEmulator::new(
      profile,
      EmulatorOptions {
        verify: config.verify_upstream,
        extra_roots: Vec::new(),
        handshake_timeout: config.handshake_timeout,
        key_log: key_log.clone(),
      },
    )?;

    let dialer = UpstreamDialer::new(config.upstream.clone(), config.connect_timeout);
    match dialer.upstream() {
      Some(upstream) => tracing::info!("dialing through SOCKS5 upstream {}", upstream.address()),
      None => tracing::info!("dialing origins directly"),
    }

    Ok(ProxyContext {
      certs: CertificateManager::new(ca),
      emulator,
      dialer,
      handshake_timeout: config.handshake_timeout,
      idle_timeout: config.idle_timeout,
      key_log,
      session_key,
    })
  }
}

/// Listening proxy
pub struct ProxyServer {
  ctx: Arc<ProxyContext>,
  listener: TcpListener,
}

impl ProxyServer {
  /// Bind the listening socket. A bind failure is a configuration error.
  pub async fn bind(ctx: Arc<ProxyContext>, addr: SocketAddr) -> Result<Self> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::configuration(format!("Failed to bind to {}: {}", addr, e)))?;
    Ok(ProxyServer { ctx, listener })
  }

  /// Address actually bound, useful with port 0
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Accept connections until `shutdown` fires. Each connection runs in its
  /// own task with a child token, so shutdown also ends live sessions.
  pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
    tracing::info!("listening on {}", self.local_addr()?);
    loop {
      let accepted = tokio::select! {
        _ = shutdown.cancelled() => break,
        accepted = self.listener.accept() => accepted,
      };
      match accepted {
        Ok((stream, peer_addr)) => {
          let ctx = self.ctx.clone();
          let cancel = shutdown.child_token();
          let span = tracing::info_span!("conn", peer = %peer_addr);
          tokio::spawn(
            async move {
              if let Err(e) = handle_connection(ctx, stream, cancel).await {
                tracing::debug!("connection closed with error: {}", e);
              }
            }
            .instrument(span),
          );
        }
        Err(e) => {
          tracing::error!("Failed to accept connection: {}", e);
          tokio::time::sleep(Duration::from_millis(50)).await;
        }
      }
    }
    tracing::info!("shutting down");
    Ok(())
  }
}

async fn handle_connection(
  ctx: Arc<ProxyContext>,
  stream: TcpStream,
  cancel: CancellationToken,
) -> Result<()> {
  stream.set_nodelay(true)?;
  let mut client = BufReader::new(stream);

  let head = match tokio::time::timeout(ctx.handshake_timeout, RequestHead::read(&mut client)).await {
    Ok(Ok(Some(head))) => head,
    Ok(Ok(None)) => return Ok(()),
    Ok(Err(e)) => {
      let _ = write_status(&mut client, e.status_code()).await;
      return Err(e);
    }
    Err(_) => return Err(Error::invalid_request("timed out waiting for a request")),
  };

  match head.into_route() {
    Ok(Route::Tunnel(target)) => {
      tracing::info!("CONNECT {}", target);
      TunnelHandler::new(ctx, cancel).handle(client, target).await
    }
    Ok(Route::Forward(head)) => {
      tracing::info!("{} {}", head.method, head.target);
      PlainHttpHandler::new(ctx, cancel).handle(client, head).await
    }
    Err(e) => {
      let _ = write_status(&mut client, e.status_code()).await;
      Err(e)
    }
  }
}
