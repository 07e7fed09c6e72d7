//! Bidirectional byte relay between the two legs of a session.
use crate::errors::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 16 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Why a relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
  /// The client finished sending
  ClientClosed,
  /// The server finished sending
  ServerClosed,
  /// Neither side sent anything for the idle timeout
  IdleTimeout,
  /// The session or the whole proxy was shut down
  Cancelled,
}

/// Outcome of [`relay`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
  pub client_to_server: u64,
  pub server_to_client: u64,
  pub end: RelayEnd,
}

struct Activity {
  start: Instant,
  last_millis: AtomicU64,
}

impl Activity {
  fn new() -> Self {
    Activity {
      start: Instant::now(),
      last_millis: AtomicU64::new(0),
    }
  }

  fn touch(&self) {
    let now = self.start.elapsed().as_millis() as u64;
    self.last_millis.store(now, Ordering::Relaxed);
  }

  fn idle_for(&self) -> Duration {
    let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
    self.start.elapsed().saturating_sub(last)
  }
}

/// Copy bytes both ways until one direction ends, errors, goes idle for
/// `idle_timeout` together with the other, or `cancel` fires. Whatever
/// happens first ends both directions, and both write halves are shut down.
pub async fn relay<C, S>(
  client: C,
  server: S,
  idle_timeout: Duration,
  cancel: &CancellationToken,
) -> Result<RelayStats>
where
  C: AsyncRead + AsyncWrite + Unpin,
  S: AsyncRead + AsyncWrite + Unpin,
{
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut server_read, mut server_write) = tokio::io::split(server);
  let activity = Activity::new();
  let upstream_bytes = AtomicU64::new(0);
  let downstream_bytes = AtomicU64::new(0);

  let outcome = tokio::select! {
    r = copy_one_way(&mut client_read, &mut server_write, &activity, &upstream_bytes) => r.map(|_| RelayEnd::ClientClosed),
    r = copy_one_way(&mut server_read, &mut client_write, &activity, &downstream_bytes) => r.map(|_| RelayEnd::ServerClosed),
    _ = idle_watchdog(&activity, idle_timeout) => Ok(RelayEnd::IdleTimeout),
    _ = cancel.cancelled() => Ok(RelayEnd::Cancelled),
  };

  let _ = tokio::time::timeout(SHUTDOWN_GRACE, server_write.shutdown()).await;
  let _ = tokio::time::timeout(SHUTDOWN_GRACE, client_write.shutdown()).await;

  let client_to_server = upstream_bytes.load(Ordering::Relaxed);
  let server_to_client = downstream_bytes.load(Ordering::Relaxed);
  match outcome {
    Ok(end) => Ok(RelayStats {
      client_to_server,
      server_to_client,
      end,
    }),
    Err(e) => {
      tracing::debug!(
        "relay failed after {} bytes up, {} bytes down: {}",
        client_to_server,
        server_to_client,
        e
      );
      Err(Error::Relay(e))
    }
  }
}

async fn copy_one_way<R, W>(
  reader: &mut R,
  writer: &mut W,
  activity: &Activity,
  counter: &AtomicU64,
) -> std::io::Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; BUFFER_SIZE];
  loop {
    let n = reader.read(&mut buf).await?;
    if n == 0 {
      return Ok(());
    }
    activity.touch();
    writer.write_all(&buf[..n]).await?;
    writer.flush().await?;
    counter.fetch_add(n as u64, Ordering::Relaxed);
    activity.touch();
  }
}

async fn idle_watchdog(activity: &Activity, idle_timeout: Duration) {
  loop {
    let idle_for = activity.idle_for();
    if idle_for >= idle_timeout {
      return;
    }
    tokio::time::sleep(idle_timeout - idle_for).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn copies_both_ways_until_client_closes() {
    let (client, mut client_peer) = tokio::io::duplex(1024);
    let (server, mut server_peer) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();

    let relay_task =
      tokio::spawn(async move { relay(client, server, Duration::from_secs(5), &cancel).await });

    client_peer.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    server_peer.write_all(b"pong!").await.unwrap();
    let mut buf = [0u8; 5];
    client_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong!");

    client_peer.shutdown().await.unwrap();
    let stats = relay_task.await.unwrap().unwrap();
    assert_eq!(stats.end, RelayEnd::ClientClosed);
    assert_eq!(stats.client_to_server, 4);
    assert_eq!(stats.server_to_client, 5);

    // the server leg was shut down as well
    let mut rest = Vec::new();
    server_peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }

  #[tokio::test]
  async fn idle_relay_times_out() {
    let (client, _client_peer) = tokio::io::duplex(64);
    let (server, _server_peer) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    let stats = relay(client, server, Duration::from_millis(50), &cancel)
      .await
      .unwrap();
    assert_eq!(stats.end, RelayEnd::IdleTimeout);
  }

  #[tokio::test]
  async fn cancellation_ends_relay() {
    let (client, _client_peer) = tokio::io::duplex(64);
    let (server, _server_peer) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let stats = relay(client, server, Duration::from_secs(60), &cancel)
      .await
      .unwrap();
    assert_eq!(stats.end, RelayEnd::Cancelled);
  }
}
