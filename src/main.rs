use clap::Parser;
use mimic_mitm::{ProxyConfig, ProxyContext, ProxyServer, Result, UpstreamConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Intercepting HTTPS proxy that reaches origins with a browser TLS fingerprint
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// CA certificate PEM, generated together with the key when both are missing
  #[arg(long, default_value = "cert.pem")]
  cert: PathBuf,

  /// CA private key PEM
  #[arg(long, default_value = "key.pem")]
  key: PathBuf,

  /// Listen address, empty listens on all interfaces
  #[arg(long, default_value = "")]
  addr: String,

  /// Listen port
  #[arg(long, default_value_t = 8080)]
  port: u16,

  /// Browser profile for outbound handshakes
  #[arg(long, default_value = "chrome133")]
  browser: String,

  /// SOCKS5 upstream as host:port or host:port:user:pass
  #[arg(long, default_value = "")]
  upstream: String,

  /// Debug logging
  #[arg(long)]
  debug: bool,

  /// Outbound connect timeout in seconds
  #[arg(long, default_value_t = 10)]
  connect_timeout: u64,

  /// Relay idle timeout in seconds
  #[arg(long, default_value_t = 300)]
  idle_timeout: u64,

  /// Do not verify origin certificates
  #[arg(long)]
  insecure: bool,

  /// Append TLS secrets to this file, defaults to $SSLKEYLOGFILE
  #[arg(long)]
  keylog: Option<PathBuf>,
}

impl Cli {
  fn into_config(self) -> Result<ProxyConfig> {
    let key_log_path = self
      .keylog
      .or_else(|| std::env::var_os("SSLKEYLOGFILE").map(PathBuf::from))
      .filter(|p| !p.as_os_str().is_empty());
    Ok(ProxyConfig {
      ca_cert_path: self.cert,
      ca_key_path: self.key,
      listen_host: self.addr,
      listen_port: self.port,
      browser_profile: self.browser,
      upstream: UpstreamConfig::parse(&self.upstream)?,
      debug: self.debug,
      connect_timeout: Duration::from_secs(self.connect_timeout),
      idle_timeout: Duration::from_secs(self.idle_timeout),
      verify_upstream: !self.insecure,
      key_log_path,
      ..ProxyConfig::default()
    })
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  let config = Cli::parse().into_config();
  let directive = match &config {
    Ok(config) => config.log_directive(),
    Err(_) => ProxyConfig::default().log_directive(),
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let result = match config {
    Ok(config) => run(config).await,
    Err(e) => Err(e),
  };
  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      tracing::error!("exiting: {}", e);
      ExitCode::FAILURE
    }
  }
}

async fn run(config: ProxyConfig) -> Result<()> {
  let addr = config.listen_address()?;
  let ctx = Arc::new(ProxyContext::from_config(&config).await?);
  let server = ProxyServer::bind(ctx, addr).await?;

  let shutdown = CancellationToken::new();
  let signal = shutdown.clone();
  tokio::spawn(async move {
    match tokio::signal::ctrl_c().await {
      Ok(()) => {
        tracing::info!("interrupted");
        signal.cancel();
      }
      Err(e) => tracing::warn!("cannot listen for ctrl-c: {}", e),
    }
  });

  server.run(shutdown).await
}
