//! The masquerade model: trusted root CAs, the masquerades that rely on them
//! and the proxied-sites set, as handed to config emitters and loaded back by
//! the proxy client.

use crate::errors::Result;
use crate::filter::DomainSet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// A root CA observed at the end of verified chains, with its prevalence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaStat {
  /// Subject common name of the root
  pub common_name: String,
  /// PEM encoding with newlines escaped as `\n`
  pub cert: String,
  /// Hex SHA-256 of the DER, the key masquerades refer to this CA by
  pub fingerprint: String,
  /// Successful probes whose chain ended in this root
  #[serde(default)]
  pub occurrences: usize,
  /// `occurrences * 100 / successful probes`
  #[serde(default)]
  pub frequency: f64,
}

/// A front domain usable for disguised traffic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Masquerade {
  /// Domain presented as SNI
  pub domain: String,
  /// Address the probe actually connected to
  pub ip_address: String,
  /// Fingerprint of the root CA the domain's chain ends in
  pub root_ca: String,
}

/// Immutable snapshot of discovery output.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MasqueradeModel {
  cas: Vec<CaStat>,
  masquerades: Vec<Masquerade>,
  #[serde(default)]
  proxied_sites: DomainSet,
}

impl MasqueradeModel {
  /// Assemble a model from trusted CAs and masquerades.
  ///
  /// Masquerades referring to a CA that is not in `cas` are logged and
  /// dropped. CAs are ordered by frequency descending and masquerades by
  /// domain ascending regardless of input order.
  pub fn build(
    mut cas: Vec<CaStat>,
    masquerades: Vec<Masquerade>,
    proxied_sites: DomainSet,
  ) -> Self {
    sort_cas(&mut cas);
    let known: HashSet<&str> = cas.iter().map(|ca| ca.fingerprint.as_str()).collect();
    let mut masquerades: Vec<Masquerade> = masquerades
      .into_iter()
      .filter(|m| {
        let ok = known.contains(m.root_ca.as_str());
        if !ok {
          tracing::error!(
            "dropping masquerade {} ({}): root CA {} is not trusted",
            m.domain,
            m.ip_address,
            m.root_ca
          );
        }
        ok
      })
      .collect();
    masquerades.sort_by(|a, b| a.domain.cmp(&b.domain));
    Self {
      cas,
      masquerades,
      proxied_sites,
    }
  }

  /// Trusted CAs, most prevalent first.
  pub fn cas(&self) -> &[CaStat] {
    &self.cas
  }

  /// Trusted masquerades, by domain.
  pub fn masquerades(&self) -> &[Masquerade] {
    &self.masquerades
  }

  /// Sites the client should front.
  pub fn proxied_sites(&self) -> &DomainSet {
    &self.proxied_sites
  }

  /// Look up a trusted CA by fingerprint.
  pub fn ca(&self, fingerprint: &str) -> Option<&CaStat> {
    self.cas.iter().find(|ca| ca.fingerprint == fingerprint)
  }

  /// Serialize as a JSON document.
  pub fn to_json(&self) -> Result<String> {
    Ok(serde_json::to_string_pretty(self)?)
  }

  /// Parse a JSON document, re-establishing ordering and the CA invariant.
  pub fn from_json(text: &str) -> Result<Self> {
    let raw: MasqueradeModel = serde_json::from_str(text)?;
    Ok(Self::build(raw.cas, raw.masquerades, raw.proxied_sites))
  }

  /// Write the JSON document to `path`.
  pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
    tokio::fs::write(path.as_ref(), self.to_json()?).await?;
    Ok(())
  }

  /// Read a JSON document from `path`.
  pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
    Self::from_json(&tokio::fs::read_to_string(path.as_ref()).await?)
  }
}

/// Frequency descending; ties broken by name then fingerprint so output is stable.
pub(crate) fn sort_cas(cas: &mut [CaStat]) {
  cas.sort_by(|a, b| {
    b.frequency
      .total_cmp(&a.frequency)
      .then_with(|| a.common_name.cmp(&b.common_name))
      .then_with(|| a.fingerprint.cmp(&b.fingerprint))
  });
}
