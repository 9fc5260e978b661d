//! Masquerade discovery: probe candidate domains concurrently, coalesce the
//! roots their chains end in, and keep only widely used roots.

pub mod aggregator;
pub mod prober;

pub use aggregator::{CaTrustAggregator, TrustedSet};
pub use prober::{ProbeFailure, ProbeResult, Prober, TlsProber};

use crate::config::DiscoveryConfig;
use crate::filter::DomainSet;
use crate::model::MasqueradeModel;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// A fixed pool of probe workers feeding one aggregator.
pub struct Discovery<P> {
  prober: Arc<P>,
  blacklist: Arc<DomainSet>,
  config: DiscoveryConfig,
}

impl<P: Prober + 'static> Discovery<P> {
  /// Create a discovery run with `prober`, skipping blacklisted domains.
  pub fn new(prober: P, blacklist: DomainSet, config: DiscoveryConfig) -> Self {
    Self {
      prober: Arc::new(prober),
      blacklist: Arc::new(blacklist),
      config,
    }
  }

  /// Probe every domain and return the aggregation state once every worker
  /// has exited.
  pub async fn run(&self, domains: Vec<String>) -> CaTrustAggregator {
    let workers = self.config.workers.max(1);
    tracing::info!("probing {} domains with {} workers", domains.len(), workers);
    let (domain_tx, domain_rx) = mpsc::channel::<String>(workers * 2);
    let domain_rx = Arc::new(Mutex::new(domain_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<ProbeResult>(workers * 2);

    let mut pool = JoinSet::new();
    for id in 0..workers {
      pool.spawn(worker(
        id,
        self.prober.clone(),
        self.blacklist.clone(),
        domain_rx.clone(),
        result_tx.clone(),
      ));
    }
    // the results channel closes once the last worker drops its sender
    drop(result_tx);

    let feeder = tokio::spawn(async move {
      for domain in domains {
        if domain_tx.send(domain).await.is_err() {
          break;
        }
      }
    });

    let mut aggregator = CaTrustAggregator::new();
    while let Some(result) = result_rx.recv().await {
      aggregator.record(result);
    }

    if let Err(e) = feeder.await {
      tracing::error!("domain feeder failed: {}", e);
    }
    while let Some(joined) = pool.join_next().await {
      if let Err(e) = joined {
        tracing::error!("probe worker failed: {}", e);
      }
    }
    tracing::info!("{} successful probes", aggregator.successful_probes());
    aggregator
  }

  /// Run discovery and package the trusted output with `proxied_sites`.
  pub async fn discover(&self, domains: Vec<String>, proxied_sites: DomainSet) -> MasqueradeModel {
    let trusted = self.run(domains).await.finish(self.config.min_frequency);
    MasqueradeModel::build(trusted.cas, trusted.masquerades, proxied_sites)
  }
}

async fn worker<P: Prober>(
  id: usize,
  prober: Arc<P>,
  blacklist: Arc<DomainSet>,
  domains: Arc<Mutex<mpsc::Receiver<String>>>,
  results: mpsc::Sender<ProbeResult>,
) {
  loop {
    let next = domains.lock().await.recv().await;
    let Some(domain) = next else {
      break;
    };
    if blacklist.contains(&domain) {
      tracing::debug!("skipping blacklisted domain {}", domain);
      continue;
    }
    tracing::debug!("worker {} probing {}", id, domain);
    match prober.probe(&domain).await {
      Ok(result) => {
        if results.send(result).await.is_err() {
          break;
        }
      }
      Err(e) => tracing::warn!("unable to probe {}: {}", domain, e),
    }
  }
}
