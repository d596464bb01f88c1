//! Transparent TLS certificate provisioning for tokio servers.
//!
//! This library wraps a plain listening socket and keeps valid certificates
//! for a set of domains without a separate HTTP listener or DNS automation,
//! using the ACME TLS-ALPN-01 challenge. The TLS handshake is intercepted at
//! the SNI stage to serve either the domain's certificate, a validation
//! certificate while a challenge is in flight, or a self-signed fallback.
//!
//! # Features
//!
//! - Automatic certificate issuance and renewal, one background task per
//!   domain
//! - TLS-ALPN-01 challenge support: validation handshakes are answered on the
//!   same port as regular traffic
//! - Durable on-disk cache for keys, certificates and account credentials
//!
//! # Usage
//!
//! ```rust,no_run
//! use autotls::AutotlsConfig;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let listener = TcpListener::bind("0.0.0.0:443").await?;
//!     let config = AutotlsConfig::builder()
//!         .acme_url("https://acme-staging-v02.api.letsencrypt.org/directory")
//!         .cache_dir("./autotls-cache")
//!         .domains(vec!["example.com".to_string()])
//!         .contact("mailto:admin@example.com")
//!         .accept_tos(true)
//!         .build();
//!     let tls = config.wrap(listener).await?;
//!     loop {
//!         let (stream, peer) = tls.accept().await?;
//!         // serve the connection
//!         let _ = (stream, peer);
//!     }
//! }
//! ```
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rustls::version::{TLS12, TLS13};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::acme_client::AcmeAccount;
use crate::renewal::RenewalTask;
use crate::resolver::CertResolver;

pub use crate::cache::CertCache;
pub use crate::resolver::ACME_TLS_ALPN_NAME;

mod acme_client;
mod cache;
mod fallback;
mod renewal;
mod resolver;

/// Engine configuration.
#[allow(clippy::duplicated_attributes)]
#[derive(Clone, Debug, bon::Builder)]
#[builder(on(String, into))]
#[builder(on(PathBuf, into))]
pub struct AutotlsConfig {
    /// ACME directory URL.
    acme_url: String,
    /// Directory holding cached keys and certificates.
    cache_dir: PathBuf,
    /// Domains to provision certificates for.
    domains: Vec<String>,
    /// Contact URL for the CA account, e.g. `mailto:admin@example.com`.
    contact: Option<String>,
    /// Whether the CA's terms of service are accepted.
    accept_tos: bool,
    /// Bound on one TLS handshake.
    #[builder(default = Duration::from_secs(10))]
    handshake_timeout: Duration,
}

impl AutotlsConfig {
    /// Wrap `listener` with this configuration.
    pub async fn wrap(&self, listener: TcpListener) -> Result<TlsListener> {
        wrap(listener, self.clone()).await
    }

    /// Provision the cache, the default bundle and the ACME account without
    /// serving anything.
    pub async fn provision(&self) -> Result<()> {
        self.validate()?;
        let cache = CertCache::new(&self.cache_dir)?;
        fallback::ensure_default_bundle(&cache)?;
        AcmeAccount::new(cache, self.acme_url.clone(), self.contact.clone())
            .ensure()
            .await
    }

    fn validate(&self) -> Result<()> {
        if !self.accept_tos {
            bail!("CA's terms of service must be accepted");
        }
        if self.domains.is_empty() {
            bail!("at least one domain is required");
        }
        Ok(())
    }
}

/// Wrap a listening socket with automatic certificate provisioning.
///
/// Fails before touching the cache or the network when the configuration is
/// unusable. On success the listener is ready immediately; domain
/// certificates appear in the cache as the background exchanges complete,
/// and connections are served the fallback chain until then.
pub async fn wrap(listener: TcpListener, config: AutotlsConfig) -> Result<TlsListener> {
    config.validate()?;
    let local_addr = listener
        .local_addr()
        .context("socket has no local address")?;

    let cache = CertCache::new(&config.cache_dir)?;
    fallback::ensure_default_bundle(&cache)?;

    let resolver = Arc::new(CertResolver::new(cache.clone())?);
    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&TLS13, &TLS12])
    .context("failed to build TLS config")?
    .with_no_client_auth()
    .with_cert_resolver(resolver);
    tls_config.alpn_protocols = vec![ACME_TLS_ALPN_NAME.to_vec(), b"http/1.1".to_vec()];

    let account = Arc::new(AcmeAccount::new(
        cache.clone(),
        config.acme_url.clone(),
        config.contact.clone(),
    ));
    for domain in &config.domains {
        let task = RenewalTask::new(domain.clone(), cache.clone(), account.clone());
        tokio::spawn(task.run());
    }

    info!(
        "serving TLS on {local_addr} for: {}",
        config.domains.join(", ")
    );
    Ok(TlsListener {
        listener,
        acceptor: TlsAcceptor::from(Arc::new(tls_config)),
        handshake_timeout: config.handshake_timeout,
    })
}

/// A TLS-wrapped listening socket.
///
/// Behaves like the wrapped listener, with the TLS handshake performed as
/// part of `accept`.
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("listener", &self.listener)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl TlsListener {
    /// Accept one connection and complete its TLS handshake.
    pub async fn accept(&self) -> Result<(TlsStream<TcpStream>, SocketAddr)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .context("failed to accept connection")?;
        let tls_stream = timeout(self.handshake_timeout, self.acceptor.accept(stream))
            .await
            .context("handshake timeout")?
            .context("failed to accept tls connection")?;
        debug!("accepted TLS connection from {peer}");
        Ok((tls_stream, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("socket has no local address")
    }

    /// The wrapped plain listener.
    pub fn get_ref(&self) -> &TcpListener {
        &self.listener
    }
}
