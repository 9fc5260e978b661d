#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # fronted
//!
//! The `fronted` crate discovers front domains whose certificate chains end
//! in widely trusted roots, and runs a local intercepting proxy that disguises
//! traffic behind those fronts.
//!
//! - Concurrent TLS [discovery] of masquerade domains
//! - Root CA statistics and a trust threshold
//! - A serializable [`MasqueradeModel`]
//! - Pluggable [host-spoofing protocols](protocol)
//! - HTTPS interception with per-host leaves issued by a local root
//!
//! ## Discovering masquerades
//!
//! ```rust,no_run
//! use fronted::discovery::{Discovery, TlsProber};
//! use fronted::{DiscoveryConfig, DomainSet};
//!
//! # async fn run() -> fronted::Result<()> {
//! let config = DiscoveryConfig::default();
//! let prober = TlsProber::native(config.port, config.probe_timeout())?;
//! let discovery = Discovery::new(prober, DomainSet::new(), config);
//! let model = discovery
//!   .discover(vec!["example.com".to_string()], DomainSet::new())
//!   .await;
//! println!("{}", model.to_json()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Running the proxy
//!
//! ```rust,no_run
//! # async fn run() -> fronted::Result<()> {
//! let model = fronted::MasqueradeModel::load("masquerades.json").await?;
//! let config = fronted::ClientConfig::default().with_model(&model);
//! fronted::ProxyClient::builder(config).build().await?.run().await
//! # }
//! ```

pub mod ca;
mod client;
mod config;
mod connector;
pub mod discovery;
mod errors;
mod filter;
pub mod forward;
mod model;
pub mod protocol;
mod socket;
pub mod tls;

pub use ca::{CertContext, CertificateAuthority, TrustStore};
pub use client::{is_loopback, ProxyClient, ProxyClientBuilder};
pub use config::{ClientConfig, DiscoveryConfig};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use filter::{load_domains, parse_domains, DomainSet, EXCLUDED_SUFFIX};
pub use model::{CaStat, Masquerade, MasqueradeModel};
pub use socket::{MaybeTlsStream, Socket};
