//! TLS probing of candidate masquerade domains.

use crate::connector::Connector;
use crate::tls::{escape_pem, AnchorError, RootCa, TrustedRoots};
use std::io::ErrorKind;
use std::net::IpAddr;
use std::time::Duration;

/// Outcome of a successful probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeResult {
  /// Domain that was probed
  pub domain: String,
  /// Address the TCP connection was made to
  pub resolved_ip: IpAddr,
  /// Root certificate PEM, newlines escaped
  pub root_pem: String,
  /// Root certificate common name
  pub root_common_name: String,
  /// Hex SHA-256 of the root certificate
  pub root_fingerprint: String,
}

impl ProbeResult {
  /// Build a result from the trust anchor of a verified chain.
  pub fn from_root(domain: impl Into<String>, resolved_ip: IpAddr, root: &RootCa) -> Self {
    Self {
      domain: domain.into(),
      resolved_ip,
      root_pem: escape_pem(&root.pem()),
      root_common_name: root.common_name.clone(),
      root_fingerprint: root.fingerprint(),
    }
  }
}

/// Why a domain produced no result. Every variant drops the domain for this run.
#[derive(thiserror::Error, Debug)]
pub enum ProbeFailure {
  /// DNS resolution or TCP connect failed
  #[error("unable to dial: {0}")]
  Connect(String),
  /// TLS handshake or certificate verification failed
  #[error("tls handshake failed: {0}")]
  Handshake(String),
  /// The probe did not finish in time
  #[error("timed out after {0:?}")]
  Timeout(Duration),
  /// The verified chain could not be tied to a root
  #[error(transparent)]
  Chain(#[from] AnchorError),
}

/// Something that can probe a domain for its root CA.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
  /// Probe `domain` once. No retries.
  async fn probe(&self, domain: &str) -> Result<ProbeResult, ProbeFailure>;
}

#[async_trait::async_trait]
impl<T: Prober + ?Sized> Prober for std::sync::Arc<T> {
  async fn probe(&self, domain: &str) -> Result<ProbeResult, ProbeFailure> {
    (**self).probe(domain).await
  }
}

/// Probes a domain by completing a verified TLS handshake on port 443 and
/// reading back the chain the verifier accepted.
pub struct TlsProber {
  connector: Connector,
  roots: TrustedRoots,
  port: u16,
  timeout: Duration,
}

impl TlsProber {
  /// Create a prober verifying against `roots`.
  pub fn new(roots: TrustedRoots, port: u16, timeout: Duration) -> crate::Result<Self> {
    let connector = Connector::builder()
      .roots(roots.clone())
      .connect_timeout(Some(timeout))
      .read_timeout(Some(timeout))
      .write_timeout(Some(timeout))
      .build()?;
    Ok(Self {
      connector,
      roots,
      port,
      timeout,
    })
  }

  /// Create a prober verifying against the platform's roots.
  pub fn native(port: u16, timeout: Duration) -> crate::Result<Self> {
    Self::new(TrustedRoots::native()?, port, timeout)
  }

  async fn handshake(&self, domain: &str) -> Result<ProbeResult, ProbeFailure> {
    let socket = self
      .connector
      .connect_with_host(domain, self.port)
      .await
      .map_err(|e| self.classify(e, ProbeFailure::Connect))?;
    let resolved_ip = socket
      .peer_addr()
      .map_err(|e| ProbeFailure::Connect(e.to_string()))?
      .ip();
    let tls = self
      .connector
      .upgrade_to_tls(socket, domain)
      .await
      .map_err(|e| self.classify(e, ProbeFailure::Handshake))?;
    let chain = tls.peer_certificates().unwrap_or_default();
    let root = self.roots.anchor_for(&chain)?;
    Ok(ProbeResult::from_root(domain, resolved_ip, &root))
  }

  fn classify(&self, e: crate::Error, otherwise: fn(String) -> ProbeFailure) -> ProbeFailure {
    match &e {
      crate::Error::IO(io) if io.kind() == ErrorKind::TimedOut => ProbeFailure::Timeout(self.timeout),
      _ => otherwise(e.to_string()),
    }
  }
}

#[async_trait::async_trait]
impl Prober for TlsProber {
  async fn probe(&self, domain: &str) -> Result<ProbeResult, ProbeFailure> {
    match tokio::time::timeout(self.timeout, self.handshake(domain)).await {
      Ok(result) => result,
      Err(_) => Err(ProbeFailure::Timeout(self.timeout)),
    }
  }
}
