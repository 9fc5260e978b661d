//! Domain lists: probe inputs, blacklist and proxied sites.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tokio::fs;

/// Entries under this suffix are left out of the merged proxied-sites set.
pub const EXCLUDED_SUFFIX: &str = ".ir";

/// A read-only set of domain names.
///
/// Sorted so that serialized models are stable between runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainSet {
  domains: BTreeSet<String>,
}

impl DomainSet {
  /// An empty set.
  pub fn new() -> Self {
    Self::default()
  }

  /// Whether `domain` is in the set.
  pub fn contains(&self, domain: &str) -> bool {
    self.domains.contains(domain)
  }

  /// Whether `host` or any parent domain of it is in the set.
  pub fn matches(&self, host: &str) -> bool {
    let host = host.trim_end_matches('.');
    if self.contains(host) {
      return true;
    }
    host
      .match_indices('.')
      .any(|(i, _)| self.contains(&host[i + 1..]))
  }

  /// Number of entries.
  pub fn len(&self) -> usize {
    self.domains.len()
  }

  /// Whether the set is empty.
  pub fn is_empty(&self) -> bool {
    self.domains.is_empty()
  }

  /// Iterate in ascending order.
  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.domains.iter().map(String::as_str)
  }

  /// Add every entry of `other`.
  pub fn extend(&mut self, other: DomainSet) {
    self.domains.extend(other.domains);
  }

  /// Parse a newline-separated blacklist. Blank lines are ignored.
  pub fn parse_blacklist(text: &str) -> Self {
    parse_lines(text).map(str::to_string).collect()
  }

  /// Parse one proxied-sites file: blank lines, `#` comments and entries under
  /// [`EXCLUDED_SUFFIX`] are dropped.
  pub fn parse_proxied_sites(text: &str) -> Self {
    parse_lines(text)
      .filter(|domain| !domain.starts_with('#') && !domain.ends_with(EXCLUDED_SUFFIX))
      .map(str::to_string)
      .collect()
  }

  /// Load a blacklist file.
  pub async fn load_blacklist(path: impl AsRef<Path>) -> Result<Self> {
    Ok(Self::parse_blacklist(&read(path.as_ref()).await?))
  }

  /// Load and merge every file of a proxied-sites directory, recursively.
  ///
  /// A directory that cannot be opened is logged and skipped. A file that
  /// cannot be read is an error.
  pub async fn load_proxied_sites(dir: impl AsRef<Path>) -> Result<Self> {
    let mut merged = DomainSet::new();
    let mut pending = vec![dir.as_ref().to_path_buf()];
    while let Some(dir) = pending.pop() {
      let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) => {
          tracing::error!("could not open proxied site directory {}: {}", dir.display(), e);
          continue;
        }
      };
      while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
          pending.push(path);
          continue;
        }
        merged.extend(Self::parse_proxied_sites(&read(&path).await?));
      }
    }
    tracing::debug!("loaded {} proxied sites", merged.len());
    Ok(merged)
  }
}

impl FromIterator<String> for DomainSet {
  fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
    Self {
      domains: iter.into_iter().collect(),
    }
  }
}

/// Parse a newline-separated domain list, keeping order and duplicates.
pub fn parse_domains(text: &str) -> Vec<String> {
  parse_lines(text).map(str::to_string).collect()
}

/// Load a domains file.
pub async fn load_domains(path: impl AsRef<Path>) -> Result<Vec<String>> {
  Ok(parse_domains(&read(path.as_ref()).await?))
}

fn parse_lines(text: &str) -> impl Iterator<Item = &str> {
  text.lines().map(str::trim).filter(|line| !line.is_empty())
}

// lists are plain bytes; stray non-UTF-8 bytes only spoil their own line
async fn read(path: &Path) -> Result<String> {
  let bytes = fs::read(path)
    .await
    .map_err(|e| Error::config_error(format!("unable to read {}: {}", path.display(), e)))?;
  Ok(String::from_utf8_lossy(&bytes).into_owned())
}
