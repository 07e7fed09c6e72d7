//! The `mimic-mitm` binary

mod common;

use common::{fresh_ca, scratch_dir};
use std::net::{TcpListener, TcpStream};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

fn free_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  listener.local_addr().unwrap().port()
}

/// Wait for the child to exit, killing it if it is still running after `limit`.
fn wait_with_limit(child: &mut std::process::Child, limit: Duration) -> Option<ExitStatus> {
  let deadline = Instant::now() + limit;
  while Instant::now() < deadline {
    if let Some(status) = child.try_wait().unwrap() {
      return Some(status);
    }
    std::thread::sleep(Duration::from_millis(50));
  }
  child.kill().ok();
  child.wait().ok();
  None
}

#[tokio::test]
async fn cert_without_key_exits_before_listening() {
  let ca = fresh_ca("cli-source").await;
  let dir = scratch_dir("cli-half");
  let cert_path = dir.join("cert.pem");
  let key_path = dir.join("key.pem");
  std::fs::write(&cert_path, ca.ca_cert_pem()).unwrap();
  let port = free_port();

  let mut child = Command::new(env!("CARGO_BIN_EXE_mimic-mitm"))
    .arg("--cert")
    .arg(&cert_path)
    .arg("--key")
    .arg(&key_path)
    .args(["--addr", "127.0.0.1", "--port", &port.to_string()])
    .env_remove("RUST_LOG")
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .spawn()
    .unwrap();

  let status = wait_with_limit(&mut child, Duration::from_secs(10));
  let status = status.expect("proxy kept running without a CA key");
  assert!(!status.success());
  assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
  // the half-present CA is left alone
  assert!(!key_path.exists());
  assert_eq!(std::fs::read_to_string(&cert_path).unwrap(), ca.ca_cert_pem());
}

#[tokio::test]
async fn invalid_listen_address_is_rejected() {
  let dir = scratch_dir("cli-addr");
  let status = Command::new(env!("CARGO_BIN_EXE_mimic-mitm"))
    .arg("--cert")
    .arg(dir.join("cert.pem"))
    .arg("--key")
    .arg(dir.join("key.pem"))
    .args(["--addr", "proxy.internal", "--debug"])
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .status()
    .unwrap();
  assert!(!status.success());
  // the address is checked before the CA is touched
  assert!(!dir.join("cert.pem").exists());
}
