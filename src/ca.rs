//! Local certificate authority for terminating intercepted HTTPS
//!
//! The root is generated on first run and persisted; leaf certificates are
//! issued per hostname on demand and cached.
//!

use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Common name of the generated root
pub const ROOT_COMMON_NAME: &str = "fronted local root";
/// File name of the persisted root certificate
pub const CA_CERT_FILE: &str = "ca_cert.pem";
/// File name of the persisted root key
pub const CA_KEY_FILE: &str = "ca_key.pem";

/// Leaf validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Leaf cache time-to-live, well inside leaf validity
const CACHE_TTL: u64 = (TTL_SECS / 2) as u64;
/// Leaves kept in memory at once
const CACHE_CAPACITY: u64 = 1000;
/// Backdate not_before to tolerate clock skew
const NOT_BEFORE_OFFSET: i64 = 60;

/// Root key pair and certificate
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the root from `storage_path`, generating and persisting it if
  /// either file is missing.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }

    let ca_cert_path = storage_path.join(CA_CERT_FILE);
    let ca_key_path = storage_path.join(CA_KEY_FILE);

    let (issuer, ca_cert_der, ca_cert_pem) = if ca_cert_path.exists() && ca_key_path.exists() {
      tracing::debug!("loading root certificate from {}", ca_cert_path.display());
      Self::load_ca(&ca_cert_path, &ca_key_path).await?
    } else {
      tracing::info!("generating root certificate in {}", storage_path.display());
      Self::generate_ca(&ca_cert_path, &ca_key_path).await?
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem,
      storage_path,
    })
  }

  async fn load_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate_error(format!("failed to parse root key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("failed to load root certificate: {}", e)))?;
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("no certificate found in root PEM"))?
      .map_err(|e| Error::certificate_error(format!("failed to parse root PEM: {}", e)))?;

    Ok((issuer, cert_der, cert_pem))
  }

  async fn generate_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, "fronted");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("failed to generate root key: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("failed to self-sign root: {}", e)))?;

    let cert_pem = cert.pem();
    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;
    let mut key_file = fs::File::create(key_path).await?;
    key_file.write_all(key_pair.serialize_pem().as_bytes()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::new(params, key_pair);
    Ok((issuer, cert_der, cert_pem))
  }

  /// Generate a leaf for `host` signed by the root.
  ///
  /// Returns the chain `[leaf, root]` and the leaf key. IP literals get an IP SAN.
  pub fn generate_server_cert(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.subject_alt_names = match host.parse::<IpAddr>() {
      Ok(ip) => vec![SanType::IpAddress(ip)],
      Err(_) => vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate_error(format!("invalid host name: {}", host))
      })?)],
    };
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("failed to generate leaf key: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("failed to sign leaf for {}: {}", host, e)))?;
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("failed to serialize leaf key"))?;

    Ok((
      vec![CertificateDer::from(cert.der().to_vec()), self.ca_cert_der.clone()],
      key_der,
    ))
  }

  /// Root certificate DER.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Root certificate PEM, as loaded or generated.
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }
}

/// An issued leaf with its chain.
pub struct LeafCert {
  /// `[leaf, root]`
  pub chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl LeafCert {
  /// The leaf's private key.
  pub fn key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }

  /// A server config presenting this leaf over HTTP/1.1.
  pub fn server_config(&self) -> Result<ServerConfig> {
    let provider = rustls::crypto::CryptoProvider::get_default()
      .cloned()
      .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
    let mut config = ServerConfig::builder_with_provider(provider)
      .with_safe_default_protocol_versions()?
      .with_no_client_auth()
      .with_single_cert(self.chain.clone(), self.key())?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
  }
}

/// Root plus a bounded cache of leaves keyed by hostname.
///
/// Concurrent first use of a hostname issues exactly one leaf: the cache
/// runs a single initializer per key and every waiter shares its result.
pub struct CertContext {
  ca: CertificateAuthority,
  leaves: Cache<String, Arc<LeafCert>>,
  issued: AtomicUsize,
}

impl CertContext {
  /// Load or generate the root in `storage_path`. Idempotent.
  pub async fn ensure_root(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::new(storage_path).await?;
    let leaves = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();
    Ok(Self {
      ca,
      leaves,
      issued: AtomicUsize::new(0),
    })
  }

  /// Cached or freshly issued leaf for `host`.
  pub async fn issue_leaf(&self, host: &str) -> Result<Arc<LeafCert>> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    self
      .leaves
      .try_get_with(host.clone(), async {
        let (chain, key) = self.ca.generate_server_cert(&host)?;
        self.issued.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("issued leaf certificate for {}", host);
        Ok::<_, Error>(Arc::new(LeafCert { chain, key }))
      })
      .await
      .map_err(|e| Error::Certificate(e.to_string()))
  }

  /// Number of leaves generated since start.
  pub fn issued(&self) -> usize {
    self.issued.load(Ordering::SeqCst)
  }

  /// The root.
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Install the root into `store` unless it is already there.
  pub fn install_if_necessary(&self, store: &dyn TrustStore) -> Result<()> {
    if store.is_installed(self.ca.ca_cert_pem())? {
      tracing::debug!("root certificate already in trust store");
      return Ok(());
    }
    tracing::debug!("adding root certificate to trust store");
    store.install(&self.ca.ca_cert_path())
  }
}

/// A platform trust store the local root can be installed into.
pub trait TrustStore: Send + Sync {
  /// Whether `cert_pem` is already trusted.
  fn is_installed(&self, cert_pem: &str) -> Result<bool>;
  /// Trust the certificate at `cert_path`.
  fn install(&self, cert_path: &Path) -> Result<()>;
}

/// Trust store that cannot install anything and asks the user to do it.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManualTrustStore;

impl TrustStore for ManualTrustStore {
  fn is_installed(&self, _cert_pem: &str) -> Result<bool> {
    Ok(false)
  }

  fn install(&self, cert_path: &Path) -> Result<()> {
    Err(Error::Other(format!(
      "automatic installation unsupported, add {} to the trust store manually",
      cert_path.display()
    )))
  }
}
