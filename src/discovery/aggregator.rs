//! Coalescing of probe results into per-root statistics.

use super::prober::ProbeResult;
use crate::model::{sort_cas, CaStat, Masquerade};
use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Trusted output of one discovery run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrustedSet {
  /// CAs above the threshold, most prevalent first
  pub cas: Vec<CaStat>,
  /// One masquerade per domain, by domain
  pub masquerades: Vec<Masquerade>,
}

/// Per-run aggregation state. Owned by the single consumer of the results
/// channel, so no locking.
#[derive(Debug, Default)]
pub struct CaTrustAggregator {
  // keyed by escaped PEM
  cas: HashMap<String, CaStat>,
  masquerades: Vec<Masquerade>,
  successful: usize,
}

impl CaTrustAggregator {
  /// A fresh aggregator.
  pub fn new() -> Self {
    Self::default()
  }

  /// Count one successful probe.
  pub fn record(&mut self, result: ProbeResult) {
    let ca = self
      .cas
      .entry(result.root_pem.clone())
      .or_insert_with(|| CaStat {
        common_name: result.root_common_name.clone(),
        cert: result.root_pem.clone(),
        fingerprint: result.root_fingerprint.clone(),
        occurrences: 0,
        frequency: 0.0,
      });
    ca.occurrences += 1;
    tracing::debug!(
      "{} ({}) chains to {}",
      result.domain,
      result.resolved_ip,
      ca.common_name
    );
    self.masquerades.push(Masquerade {
      domain: result.domain,
      ip_address: result.resolved_ip.to_string(),
      root_ca: ca.fingerprint.clone(),
    });
    self.successful += 1;
  }

  /// Number of results recorded.
  pub fn successful_probes(&self) -> usize {
    self.successful
  }

  /// Every CA seen so far with its frequency filled in, most prevalent first.
  pub fn stats(&self) -> Vec<CaStat> {
    if self.successful == 0 {
      return Vec::new();
    }
    let total = self.successful as f64;
    let mut stats: Vec<CaStat> = self
      .cas
      .values()
      .map(|ca| CaStat {
        frequency: ca.occurrences as f64 * 100.0 / total,
        ..ca.clone()
      })
      .collect();
    sort_cas(&mut stats);
    stats
  }

  /// Apply the trust threshold. A CA is kept only if its frequency is
  /// strictly greater than `threshold`; masquerades follow their CA.
  pub fn finish(self, threshold: f64) -> TrustedSet {
    let stats = self.stats();
    for ca in &stats {
      tracing::info!(
        "{}: {} occurrences, {:.2}%",
        ca.common_name,
        ca.occurrences,
        ca.frequency
      );
    }
    let cas: Vec<CaStat> = stats
      .into_iter()
      .filter(|ca| ca.frequency > threshold)
      .collect();
    let frequency: HashMap<&str, f64> = cas
      .iter()
      .map(|ca| (ca.fingerprint.as_str(), ca.frequency))
      .collect();

    let mut by_domain: HashMap<String, Masquerade> = HashMap::new();
    for m in self.masquerades {
      let Some(&freq) = frequency.get(m.root_ca.as_str()) else {
        tracing::debug!("{} dropped: root {} is not trusted", m.domain, m.root_ca);
        continue;
      };
      match by_domain.entry(m.domain.clone()) {
        Entry::Vacant(slot) => {
          slot.insert(m);
        }
        Entry::Occupied(mut slot) => {
          let current = frequency
            .get(slot.get().root_ca.as_str())
            .copied()
            .unwrap_or_default();
          if prefer(&m, freq, slot.get(), current) {
            slot.insert(m);
          }
        }
      }
    }
    let mut masquerades: Vec<Masquerade> = by_domain.into_values().collect();
    masquerades.sort_by(|a, b| a.domain.cmp(&b.domain));

    TrustedSet { cas, masquerades }
  }
}

// Higher CA frequency wins; the rest only makes repeated runs agree.
fn prefer(candidate: &Masquerade, candidate_freq: f64, held: &Masquerade, held_freq: f64) -> bool {
  match candidate_freq.total_cmp(&held_freq) {
    Ordering::Greater => true,
    Ordering::Less => false,
    Ordering::Equal => {
      (&candidate.root_ca, &candidate.ip_address) < (&held.root_ca, &held.ip_address)
    }
  }
}
