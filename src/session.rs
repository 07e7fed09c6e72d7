//! Process-wide session key and the optional NSS key-log writer.
use crate::errors::{Error, Result};
use rand::RngCore;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_rustls::rustls::KeyLog as RustlsKeyLog;

/// Random master value generated once at startup. Never persisted.
#[derive(Clone)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
  /// Fill a new key from the thread-local CSPRNG
  pub fn generate() -> Self {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    SessionKey(key)
  }

  /// Short identifier safe to print: hex of the first 8 bytes.
  pub fn id(&self) -> String {
    hex::encode(&self.0[..8])
  }

  /// Raw key bytes
  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }
}

impl fmt::Debug for SessionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("SessionKey").field(&self.id()).finish()
  }
}

/// Appends TLS secrets in NSS key-log format (`SSLKEYLOGFILE`).
///
/// Both TLS stacks write here: rustls through the [`RustlsKeyLog`] impl for
/// the client-facing leg, BoringSSL through [`KeyLog::log_line`] for the
/// outbound leg.
pub struct KeyLog {
  path: PathBuf,
  file: Mutex<File>,
}

impl KeyLog {
  /// Open `path` for appending and write a header naming the session.
  pub fn open(path: impl AsRef<Path>, session_key: &SessionKey) -> Result<Self> {
    let path = path.as_ref();
    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(path)
      .map_err(|e| {
        Error::configuration(format!("cannot open key log {}: {}", path.display(), e))
      })?;
    writeln!(file, "# mimic-mitm session {}", session_key.id())?;
    tracing::warn!("writing TLS secrets to {}", path.display());
    Ok(KeyLog {
      path: path.to_path_buf(),
      file: Mutex::new(file),
    })
  }

  /// Append one already formatted line (BoringSSL's key-log callback hands these over).
  pub fn log_line(&self, line: &str) {
    let Ok(mut file) = self.file.lock() else {
      return;
    };
    if let Err(e) = writeln!(file, "{}", line) {
      tracing::warn!("key log {}: {}", self.path.display(), e);
    }
  }
}

impl RustlsKeyLog for KeyLog {
  fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
    self.log_line(&format!(
      "{} {} {}",
      label,
      hex::encode(client_random),
      hex::encode(secret)
    ));
  }
}

impl fmt::Debug for KeyLog {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeyLog").field("path", &self.path).finish()
  }
}
