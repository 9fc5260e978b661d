//! Runtime configuration for discovery runs and the proxy client.

use crate::errors::{Error, Result};
use crate::filter::DomainSet;
use crate::model::{CaStat, Masquerade, MasqueradeModel};
use crate::protocol::ProtocolConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a masquerade discovery run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
  /// Number of concurrent probe workers
  pub workers: usize,
  /// Timeout for one probe (connect plus handshake), in seconds
  pub probe_timeout_secs: u64,
  /// Port probed on every domain
  pub port: u16,
  /// A root CA is trusted only if its frequency is strictly greater than this percentage
  pub min_frequency: f64,
}

impl Default for DiscoveryConfig {
  fn default() -> Self {
    Self {
      workers: 50,
      probe_timeout_secs: 10,
      port: 443,
      min_frequency: 3.0,
    }
  }
}

impl DiscoveryConfig {
  /// Probe timeout as a `Duration`.
  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.probe_timeout_secs)
  }
}

/// Configuration for the intercepting proxy client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  /// Address the local proxy listens on
  pub listen_addr: String,
  /// Per-read deadline on client and upstream sockets, in seconds. 0 disables.
  pub read_timeout_secs: u64,
  /// Per-write deadline on client and upstream sockets, in seconds. 0 disables.
  pub write_timeout_secs: u64,
  /// Upstream connect and handshake timeout, in seconds
  pub connect_timeout_secs: u64,
  /// Front requests to loopback hosts too
  pub should_proxy_loopback: bool,
  /// Log request and response headers
  pub should_dump_headers: bool,
  /// Directory holding `ca_cert.pem` and `ca_key.pem`
  pub ca_storage_path: PathBuf,
  /// Flush cadence for streamed response bodies, in milliseconds
  pub flush_interval_ms: u64,
  /// Host-spoofing protocol
  pub protocol: ProtocolConfig,
  /// Front domains to dial
  pub masquerades: Vec<Masquerade>,
  /// Root CAs masquerade connections are verified against
  pub trusted_cas: Vec<CaStat>,
  /// Sites to front; empty fronts everything
  pub proxied_sites: DomainSet,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      listen_addr: "127.0.0.1:8787".to_string(),
      read_timeout_secs: 30,
      write_timeout_secs: 30,
      connect_timeout_secs: 10,
      should_proxy_loopback: false,
      should_dump_headers: false,
      ca_storage_path: PathBuf::from(".fronted"),
      flush_interval_ms: 100,
      protocol: ProtocolConfig::default(),
      masquerades: Vec::new(),
      trusted_cas: Vec::new(),
      proxied_sites: DomainSet::new(),
    }
  }
}

impl ClientConfig {
  /// Parse a JSON config; missing fields take their defaults.
  pub fn from_json(text: &str) -> Result<Self> {
    serde_json::from_str(text).map_err(|e| Error::config_error(format!("invalid client config: {}", e)))
  }

  /// Load a JSON config file.
  pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
      .await
      .map_err(|e| Error::config_error(format!("unable to read {}: {}", path.display(), e)))?;
    Self::from_json(&text)
  }

  /// Take trusted CAs, masquerades and proxied sites from a discovery model.
  pub fn with_model(mut self, model: &MasqueradeModel) -> Self {
    self.trusted_cas = model.cas().to_vec();
    self.masquerades = model.masquerades().to_vec();
    self.proxied_sites = model.proxied_sites().clone();
    self
  }

  /// The model view of the trusted data, re-validated.
  pub fn model(&self) -> MasqueradeModel {
    MasqueradeModel::build(
      self.trusted_cas.clone(),
      self.masquerades.clone(),
      self.proxied_sites.clone(),
    )
  }

  /// Read timeout, `None` when disabled.
  pub fn read_timeout(&self) -> Option<Duration> {
    non_zero_secs(self.read_timeout_secs)
  }

  /// Write timeout, `None` when disabled.
  pub fn write_timeout(&self) -> Option<Duration> {
    non_zero_secs(self.write_timeout_secs)
  }

  /// Connect timeout, `None` when disabled.
  pub fn connect_timeout(&self) -> Option<Duration> {
    non_zero_secs(self.connect_timeout_secs)
  }

  /// Default flush interval for response bodies.
  pub fn flush_interval(&self) -> Duration {
    Duration::from_millis(self.flush_interval_ms)
  }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
  (secs > 0).then(|| Duration::from_secs(secs))
}
