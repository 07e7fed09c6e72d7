#![cfg_attr(docsrs, feature(doc_cfg))]

//! # mimic-mitm
//!
//! An intercepting HTTPS forward proxy. Clients send `CONNECT`, the proxy
//! terminates their TLS with a leaf certificate minted by a local root CA,
//! and opens its own TLS connection to the origin whose Client Hello looks
//! like a real browser's.
//!
//! # Features
//!
//! - Root CA loaded from disk or generated on first run
//! - Leaf certificates cached per hostname, signed once per validity period
//! - Outbound handshakes shaped by a [`BrowserProfile`] (Chrome, Firefox, Safari)
//! - Optional SOCKS5 upstream with username/password authentication
//! - Plain HTTP forwarding for absolute-form requests
//! - `SSLKEYLOGFILE` style key logging for both legs
//!
//! # Fingerprint
//!
//! Every outbound hello carries the profile's suites, groups, signature
//! algorithms and extensions in BoringSSL's fixed order. The one exception is
//! ALPN: when the intercepted client does not speak every protocol the
//! profile offers (no ALPN at all counts as `http/1.1` only), the origin is
//! offered the narrower list so it cannot pick a protocol the client would
//! not understand. Those hellos differ from the profile in that extension.
//!
//! # Example
//!
//! ```no_run
//! use mimic_mitm::{ProxyConfig, ProxyContext, ProxyServer};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::default();
//!     let ctx = Arc::new(ProxyContext::from_config(&config).await?);
//!     let server = ProxyServer::bind(ctx, config.listen_address()?).await?;
//!     server.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

mod ca;
mod config;
mod emulator;
mod errors;
pub mod fingerprint;
mod forward;
mod http_head;
mod relay;
mod server;
mod session;
mod tunnel;
mod upstream;

pub use ca::{CertificateAuthority, CertificateManager, LeafCert};
pub use config::ProxyConfig;
pub use emulator::{EmulatedStream, EmulatorOptions, TlsEmulator};
pub use errors::{Error, ReplyError, Result};
pub use fingerprint::{BrowserProfile, ClientHello};
pub use forward::PlainHttpHandler;
pub use http_head::{write_status, ConnectTarget, RequestHead, Route};
pub use relay::{relay, RelayEnd, RelayStats};
pub use server::{ProxyContext, ProxyServer};
pub use session::{KeyLog, SessionKey};
pub use tunnel::{TunnelHandler, TunnelState};
pub use upstream::{UpstreamConfig, UpstreamDialer};
