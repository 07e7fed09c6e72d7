//! Shared fixtures: scratch directories, a SOCKS5 server and a TLS origin.
#![allow(dead_code)]

use mimic_mitm::{CertificateAuthority, CertificateManager};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::TlsAcceptor;

static SCRATCH: AtomicUsize = AtomicUsize::new(0);

/// Fresh, empty directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!(
    "mimic-mitm-test-{}-{}-{}",
    name,
    std::process::id(),
    SCRATCH.fetch_add(1, Ordering::Relaxed)
  ));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  std::fs::create_dir_all(&dir).unwrap();
  dir
}

/// A CA generated into its own scratch directory.
pub async fn fresh_ca(name: &str) -> CertificateAuthority {
  let dir = scratch_dir(name);
  CertificateAuthority::load_or_generate(dir.join("cert.pem"), dir.join("key.pem"))
    .await
    .unwrap()
}

/// SOCKS5 server behaviour
#[derive(Clone)]
pub struct SocksOptions {
  /// Required user name and password
  pub credentials: Option<(String, String)>,
  /// Reply code sent for CONNECT, anything but 0 refuses
  pub reply: u8,
}

pub struct SocksServer {
  pub addr: SocketAddr,
  /// `(host, port)` of every CONNECT received, as sent on the wire
  pub requests: Arc<Mutex<Vec<(String, u16)>>>,
}

/// Minimal RFC 1928/1929 server that connects to whatever it is asked to.
pub async fn spawn_socks5(options: SocksOptions) -> SocksServer {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let requests = Arc::new(Mutex::new(Vec::new()));
  let seen = requests.clone();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        return;
      };
      let options = options.clone();
      let seen = seen.clone();
      tokio::spawn(async move {
        let _ = serve_socks5(stream, options, seen).await;
      });
    }
  });
  SocksServer { addr, requests }
}

async fn serve_socks5(
  mut stream: TcpStream,
  options: SocksOptions,
  seen: Arc<Mutex<Vec<(String, u16)>>>,
) -> std::io::Result<()> {
  let mut head = [0u8; 2];
  stream.read_exact(&mut head).await?;
  assert_eq!(head[0], 5);
  let mut methods = vec![0u8; head[1] as usize];
  stream.read_exact(&mut methods).await?;

  match &options.credentials {
    Some((user, pass)) => {
      if !methods.contains(&2) {
        stream.write_all(&[5, 0xff]).await?;
        return Ok(());
      }
      stream.write_all(&[5, 2]).await?;
      let mut version_len = [0u8; 2];
      stream.read_exact(&mut version_len).await?;
      let mut got_user = vec![0u8; version_len[1] as usize];
      stream.read_exact(&mut got_user).await?;
      let mut pass_len = [0u8; 1];
      stream.read_exact(&mut pass_len).await?;
      let mut got_pass = vec![0u8; pass_len[0] as usize];
      stream.read_exact(&mut got_pass).await?;
      if got_user != user.as_bytes() || got_pass != pass.as_bytes() {
        stream.write_all(&[1, 1]).await?;
        return Ok(());
      }
      stream.write_all(&[1, 0]).await?;
    }
    None => stream.write_all(&[5, 0]).await?,
  }

  let mut request = [0u8; 4];
  stream.read_exact(&mut request).await?;
  let host = match request[3] {
    1 => {
      let mut ip = [0u8; 4];
      stream.read_exact(&mut ip).await?;
      std::net::Ipv4Addr::from(ip).to_string()
    }
    3 => {
      let mut len = [0u8; 1];
      stream.read_exact(&mut len).await?;
      let mut name = vec![0u8; len[0] as usize];
      stream.read_exact(&mut name).await?;
      String::from_utf8_lossy(&name).into_owned()
    }
    4 => {
      let mut ip = [0u8; 16];
      stream.read_exact(&mut ip).await?;
      std::net::Ipv6Addr::from(ip).to_string()
    }
    other => panic!("address type {}", other),
  };
  let port = stream.read_u16().await?;
  seen.lock().unwrap().push((host.clone(), port));

  if options.reply != 0 {
    stream.write_all(&[5, options.reply, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
    return Ok(());
  }
  let mut target = TcpStream::connect((host.as_str(), port)).await?;
  stream.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0]).await?;
  tokio::io::copy_bidirectional(&mut stream, &mut target).await?;
  Ok(())
}

/// A listener that accepts and then never answers.
pub async fn spawn_black_hole() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let mut held = Vec::new();
    while let Ok((stream, _)) = listener.accept().await {
      held.push(stream);
    }
  });
  addr
}

pub const ORIGIN_BODY: &str = "hello from origin";

pub struct Origin {
  pub addr: SocketAddr,
  /// Root that signed the origin's certificate
  pub root: CertificateDer<'static>,
  /// ALPN protocol negotiated on each accepted connection
  pub negotiated: mpsc::UnboundedReceiver<Option<Vec<u8>>>,
}

/// HTTPS origin on 127.0.0.1 with a `localhost` certificate from its own CA.
/// Each connection reads one request head and answers with [`ORIGIN_BODY`].
pub async fn spawn_origin(alpn: &[&str]) -> Origin {
  let ca = fresh_ca("origin-ca").await;
  let root = ca.ca_cert_der().clone();
  let certs = CertificateManager::new(ca);
  let leaf = certs.get_or_issue("localhost").await.unwrap();
  let mut config = leaf.server_config(None, None).unwrap();
  config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
  let acceptor = TlsAcceptor::from(Arc::new(config));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, negotiated) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      let tx = tx.clone();
      tokio::spawn(async move {
        let Ok(mut tls) = acceptor.accept(stream).await else {
          return;
        };
        let _ = tx.send(tls.get_ref().1.alpn_protocol().map(|p| p.to_vec()));
        if read_head(&mut tls).await.is_ok() {
          let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            ORIGIN_BODY.len(),
            ORIGIN_BODY
          );
          let _ = tls.write_all(response.as_bytes()).await;
          let _ = tls.shutdown().await;
        }
      });
    }
  });
  Origin {
    addr,
    root,
    negotiated,
  }
}

/// Plain HTTP origin answering every request with [`ORIGIN_BODY`] and
/// reporting the request head it saw.
pub async fn spawn_plain_origin() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, heads) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      let tx = tx.clone();
      tokio::spawn(async move {
        if let Ok(head) = read_head(&mut stream).await {
          let _ = tx.send(head);
          let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            ORIGIN_BODY.len(),
            ORIGIN_BODY
          );
          let _ = stream.write_all(response.as_bytes()).await;
          let _ = stream.shutdown().await;
        }
      });
    }
  });
  (addr, heads)
}

/// Read bytes up to and including the first blank line.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<String> {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    stream.read_exact(&mut byte).await?;
    head.push(byte[0]);
  }
  Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Read until the peer closes, tolerating a missing close_notify.
pub async fn read_all<S: AsyncRead + Unpin>(stream: &mut S) -> String {
  let mut out = Vec::new();
  let mut buf = [0u8; 4096];
  loop {
    match stream.read(&mut buf).await {
      Ok(0) | Err(_) => break,
      Ok(n) => out.extend_from_slice(&buf[..n]),
    }
  }
  String::from_utf8_lossy(&out).into_owned()
}

/// Send a CONNECT through the proxy at `proxy` and return the open
/// stream with the proxy's status line.
pub async fn connect_via(proxy: SocketAddr, authority: &str) -> (TcpStream, String) {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  let request = format!(
    "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n",
    authority, authority
  );
  stream.write_all(request.as_bytes()).await.unwrap();
  let head = read_head(&mut stream).await.unwrap();
  let status = head.lines().next().unwrap_or_default().to_string();
  (stream, status)
}
