//! TLS configuration and types
//!
//! Root stores, PEM helpers and trust-anchor resolution for verified chains.
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::RootCertStore;
use x509_parser::certificate::X509Certificate;

/// A root certificate as PEM text, decoded on demand.
#[derive(Clone, Debug)]
pub struct Certificate {
  pem: Vec<u8>,
}

impl Certificate {
  /// Create a `Certificate` from a PEM encoded certificate
  pub fn from_pem(pem: &[u8]) -> crate::Result<Certificate> {
    Ok(Certificate { pem: pem.to_owned() })
  }

  /// Create a `Certificate` from PEM text whose newlines were escaped as `\n`,
  /// the form root certificates take inside a masquerade model.
  pub fn from_escaped_pem(escaped: &str) -> crate::Result<Certificate> {
    Self::from_pem(unescape_pem(escaped).as_bytes())
  }

  pub(crate) fn into_der(self) -> crate::Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut self.pem.as_slice())
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|_| crate::errors::builder("invalid certificate encoding"))?;
    if certs.is_empty() {
      return Err(crate::errors::builder("no certificate found in PEM"));
    }
    Ok(certs)
  }
}

/// PEM-encode a DER certificate.
pub fn pem_encode(der: &[u8]) -> String {
  let b64 = STANDARD.encode(der);
  let mut pem = String::with_capacity(b64.len() + b64.len() / 64 + 64);
  pem.push_str("-----BEGIN CERTIFICATE-----\n");
  for line in b64.as_bytes().chunks(64) {
    // base64 output is ASCII
    pem.push_str(std::str::from_utf8(line).unwrap_or_default());
    pem.push('\n');
  }
  pem.push_str("-----END CERTIFICATE-----\n");
  pem
}

/// Escape newlines so PEM text can be embedded as a single-line string constant.
pub fn escape_pem(pem: &str) -> String {
  pem.replace('\n', "\\n")
}

/// Inverse of [`escape_pem`].
pub fn unescape_pem(escaped: &str) -> String {
  escaped.replace("\\n", "\n")
}

/// Hex SHA-256 of a DER certificate.
pub fn fingerprint(der: &[u8]) -> String {
  let digest = ring::digest::digest(&ring::digest::SHA256, der);
  digest.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Why a presented chain could not be tied to a trust anchor.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AnchorError {
  /// The server presented no certificates
  #[error("empty certificate chain")]
  EmptyChain,
  /// A certificate in the chain or the store failed to parse
  #[error("malformed certificate: {0}")]
  Malformed(String),
  /// No root in the store signs the chain
  #[error("no trust anchor found for chain")]
  NoAnchor,
}

/// A root certificate resolved as the end of a verified chain.
#[derive(Clone, Debug)]
pub struct RootCa {
  /// DER of the root certificate
  pub der: CertificateDer<'static>,
  /// Subject common name, or the full subject when the root has no CN
  pub common_name: String,
}

impl RootCa {
  /// PEM of the root certificate.
  pub fn pem(&self) -> String {
    pem_encode(self.der.as_ref())
  }
  /// Hex SHA-256 of the root certificate.
  pub fn fingerprint(&self) -> String {
    fingerprint(self.der.as_ref())
  }
}

/// A set of trusted root certificates, kept both as a rustls store for
/// verification and as raw certificates so that the anchor of a verified
/// chain can be recovered.
#[derive(Clone, Debug)]
pub struct TrustedRoots {
  store: Arc<RootCertStore>,
  certs: Arc<Vec<CertificateDer<'static>>>,
  by_subject: Arc<HashMap<Vec<u8>, Vec<usize>>>,
}

impl TrustedRoots {
  /// Load the platform's native root certificates.
  pub fn native() -> crate::Result<Self> {
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
      tracing::warn!("error loading native root certificate: {}", e);
    }
    if loaded.certs.is_empty() {
      return Err(crate::Error::certificate_error(
        "no native root certificates available",
      ));
    }
    Ok(Self::from_der(loaded.certs))
  }

  /// Build from a list of certificates, e.g. the trusted CAs of a model.
  pub fn from_certificates(certs: Vec<Certificate>) -> crate::Result<Self> {
    let mut ders = Vec::new();
    for cert in certs {
      ders.extend(cert.into_der()?);
    }
    Ok(Self::from_der(ders))
  }

  /// Build from DER certificates. Unparsable certificates are skipped.
  pub fn from_der(certs: Vec<CertificateDer<'static>>) -> Self {
    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs.iter().cloned());
    if ignored > 0 {
      tracing::debug!("ignored {} unparsable root certificates", ignored);
    }
    tracing::debug!("loaded {} root certificates", added);
    let mut kept = Vec::with_capacity(certs.len());
    let mut by_subject: HashMap<Vec<u8>, Vec<usize>> = HashMap::new();
    for der in certs {
      if let Ok((_, parsed)) = x509_parser::parse_x509_certificate(der.as_ref()) {
        by_subject
          .entry(parsed.subject().as_raw().to_vec())
          .or_default()
          .push(kept.len());
        kept.push(der.clone());
      }
    }
    Self {
      store: Arc::new(store),
      certs: Arc::new(kept),
      by_subject: Arc::new(by_subject),
    }
  }

  /// The rustls store for these roots.
  pub fn store(&self) -> Arc<RootCertStore> {
    self.store.clone()
  }

  /// Number of roots.
  pub fn len(&self) -> usize {
    self.certs.len()
  }

  /// Whether the set is empty.
  pub fn is_empty(&self) -> bool {
    self.certs.is_empty()
  }

  /// Resolve the trust anchor that terminates an already verified chain.
  ///
  /// Walks the presented chain from the end-entity certificate, at each step
  /// preferring a root whose subject matches the issuer and whose key verifies
  /// the signature, then falling back to a presented intermediate. This is the
  /// same search order the webpki path builder uses, so the root returned is
  /// the last certificate of the path that was actually validated.
  pub fn anchor_for(&self, presented: &[CertificateDer<'_>]) -> Result<RootCa, AnchorError> {
    if presented.is_empty() {
      return Err(AnchorError::EmptyChain);
    }
    let parsed = presented
      .iter()
      .map(|der| {
        x509_parser::parse_x509_certificate(der.as_ref())
          .map(|(_, cert)| cert)
          .map_err(|e| AnchorError::Malformed(e.to_string()))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let mut current = 0;
    for _ in 0..parsed.len() {
      let cert = &parsed[current];
      if let Some(root) = self.root_signing(cert)? {
        return Ok(root);
      }
      let next = parsed.iter().enumerate().skip(1).find(|(i, candidate)| {
        *i != current
          && candidate.subject().as_raw() == cert.issuer().as_raw()
          && cert.verify_signature(Some(candidate.public_key())).is_ok()
      });
      match next {
        Some((i, _)) => current = i,
        None => break,
      }
    }
    Err(AnchorError::NoAnchor)
  }

  fn root_signing(&self, cert: &X509Certificate<'_>) -> Result<Option<RootCa>, AnchorError> {
    let Some(candidates) = self.by_subject.get(cert.issuer().as_raw()) else {
      return Ok(None);
    };
    for &idx in candidates {
      let der = &self.certs[idx];
      let (_, root) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| AnchorError::Malformed(e.to_string()))?;
      if cert.verify_signature(Some(root.public_key())).is_ok() {
        return Ok(Some(RootCa {
          der: der.clone(),
          common_name: common_name(&root),
        }));
      }
    }
    Ok(None)
  }
}

fn common_name(cert: &X509Certificate<'_>) -> String {
  cert
    .subject()
    .iter_common_name()
    .next()
    .and_then(|cn| cn.as_str().ok())
    .map(str::to_string)
    .unwrap_or_else(|| cert.subject().to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair};

  fn root(cn: &str) -> (rcgen::Certificate, KeyPair, CertificateParams) {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert, key, params)
  }

  fn leaf(host: &str, issuer: &Issuer<'_, KeyPair>) -> rcgen::Certificate {
    let params = CertificateParams::new(vec![host.to_string()]).unwrap();
    let key = KeyPair::generate().unwrap();
    params.signed_by(&key, issuer).unwrap()
  }

  #[test]
  fn pem_escape_round_trip() {
    let (cert, _, _) = root("Escape Root");
    let pem = pem_encode(cert.der());
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
    let escaped = escape_pem(&pem);
    assert!(!escaped.contains('\n'));
    assert_eq!(unescape_pem(&escaped), pem);
    let parsed = Certificate::from_escaped_pem(&escaped).unwrap().into_der().unwrap();
    assert_eq!(parsed[0].as_ref(), cert.der().as_ref());
  }

  #[test]
  fn pem_without_certificate_is_rejected() {
    let text = Certificate::from_pem(b"not a certificate\n").unwrap();
    assert!(text.into_der().is_err());
  }

  #[test]
  fn anchor_is_root_that_signed_the_chain() {
    let (root_a, key_a, params_a) = root("Root A");
    let (root_b, _key_b, _) = root("Root B");
    let issuer = Issuer::new(params_a, key_a);
    let leaf = leaf("a.example", &issuer);
    let roots = TrustedRoots::from_der(vec![root_b.der().clone(), root_a.der().clone()]);
    let anchor = roots.anchor_for(&[leaf.der().clone()]).unwrap();
    assert_eq!(anchor.common_name, "Root A");
    assert_eq!(anchor.fingerprint(), fingerprint(root_a.der()));
  }

  #[test]
  fn anchor_through_intermediate() {
    let (root_a, key_a, params_a) = root("Root A");
    let root_issuer = Issuer::new(params_a, key_a);
    let mut inter_params = CertificateParams::default();
    inter_params
      .distinguished_name
      .push(DnType::CommonName, "Intermediate");
    inter_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let inter_key = KeyPair::generate().unwrap();
    let inter = inter_params.signed_by(&inter_key, &root_issuer).unwrap();
    let inter_issuer = Issuer::new(inter_params, inter_key);
    let leaf = leaf("b.example", &inter_issuer);

    let roots = TrustedRoots::from_der(vec![root_a.der().clone()]);
    let anchor = roots
      .anchor_for(&[leaf.der().clone(), inter.der().clone()])
      .unwrap();
    assert_eq!(anchor.common_name, "Root A");
  }

  #[test]
  fn unknown_and_empty_chains() {
    let (_root_a, key_a, params_a) = root("Root A");
    let issuer = Issuer::new(params_a, key_a);
    let leaf = leaf("c.example", &issuer);
    let roots = TrustedRoots::from_der(vec![]);
    assert_eq!(roots.anchor_for(&[leaf.der().clone()]).unwrap_err(), AnchorError::NoAnchor);
    assert_eq!(roots.anchor_for(&[]).unwrap_err(), AnchorError::EmptyChain);
    let garbage = CertificateDer::from(vec![1u8, 2, 3]);
    assert!(matches!(
      roots.anchor_for(&[garbage]).unwrap_err(),
      AnchorError::Malformed(_)
    ));
  }
}
