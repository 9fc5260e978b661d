//! Host-spoofing protocols.
//!
//! A protocol makes a request to some real site look like a request to the
//! upstream proxy reached through a trusted front domain, and reverses the
//! visible effects on the way back.

mod direct;
mod header_front;
mod path_front;

pub use direct::Direct;
pub use header_front::{HeaderFront, FRONTED_HOST_HEADER, FRONTED_SCHEME_HEADER};
pub use path_front::PathFront;

use crate::config::ClientConfig;
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::model::{CaStat, Masquerade};
use crate::socket::Socket;
use crate::tls::{Certificate, TrustedRoots};
use http::header::{HeaderValue, HOST};
use http::uri::{PathAndQuery, Scheme};
use http::{request, response, Uri};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Response headers a CDN adds on the way back through a front.
pub const CDN_RESPONSE_HEADERS: &[&str] = &[
  "cf-ray",
  "cf-cache-status",
  "cf-request-id",
  "x-amz-cf-id",
  "x-amz-cf-pop",
  FRONTED_HOST_HEADER,
  FRONTED_SCHEME_HEADER,
];

fn default_port() -> u16 {
  443
}

fn default_prefix() -> String {
  "/fronted".to_string()
}

/// Serialized protocol selection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolConfig {
  /// True host and scheme travel in headers
  HeaderFront {
    /// Host the CDN routes to, placed in the Host header
    upstream_host: String,
    /// Port masquerades are dialed on
    #[serde(default = "default_port")]
    port: u16,
  },
  /// True scheme and host travel as a leading path segment
  PathFront {
    /// Host the CDN routes to, placed in the Host header
    upstream_host: String,
    /// Path prefix ahead of the encoded target
    #[serde(default = "default_prefix")]
    prefix: String,
    /// Port masquerades are dialed on
    #[serde(default = "default_port")]
    port: u16,
  },
  /// No fronting
  #[default]
  Direct,
}

/// Where an upstream connection goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
  /// Host name or IP literal
  pub host: String,
  /// Port
  pub port: u16,
  /// Whether to speak TLS
  pub tls: bool,
}

impl Target {
  /// Derive the target of an absolute URI.
  pub fn from_uri(uri: &Uri) -> Result<Self> {
    let host = uri
      .host()
      .ok_or_else(|| Error::invalid_request(format!("no host in {}", uri)))?;
    let tls = uri.scheme() == Some(&Scheme::HTTPS);
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Ok(Self {
      host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
      port,
      tls,
    })
  }

  /// `host:port`, bracketing IPv6 literals.
  pub fn authority(&self) -> String {
    match self.host.parse::<IpAddr>() {
      Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
      _ => format!("{}:{}", self.host, self.port),
    }
  }
}

/// What every host-spoofing protocol can do.
#[async_trait::async_trait]
pub trait HostSpoofing: Send + Sync {
  /// Disguise a request bound for its real destination.
  fn rewrite_request(&self, parts: &mut request::Parts) -> Result<()>;
  /// Remove artifacts introduced by fronting from a response.
  fn rewrite_response(&self, parts: &mut response::Parts);
  /// Restore the real destination of a disguised request.
  fn recover_request(&self, parts: &mut request::Parts) -> Result<()>;
  /// Open the upstream connection for a rewritten request.
  async fn dial(&self, target: &Target) -> Result<Socket>;
}

/// The configured protocol.
pub enum Protocol {
  /// See [`HeaderFront`]
  HeaderFront(HeaderFront),
  /// See [`PathFront`]
  PathFront(PathFront),
  /// See [`Direct`]
  Direct(Direct),
}

impl Protocol {
  /// Build the protocol named by `config.protocol`, dialing the configured
  /// masquerades verified against the configured trusted CAs. Masquerades
  /// whose CA is not trusted are dropped.
  pub fn from_config(config: &ClientConfig) -> Result<Self> {
    let model = config.model();
    let connector = || {
      Connector::builder()
        .nodelay(true)
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.read_timeout())
        .write_timeout(config.write_timeout())
    };
    Ok(match &config.protocol {
      ProtocolConfig::HeaderFront {
        upstream_host,
        port,
      } => Protocol::HeaderFront(HeaderFront::new(
        upstream_host,
        MasqueradeDialer::new(model.masquerades().to_vec(), model.cas(), *port, connector())?,
      )),
      ProtocolConfig::PathFront {
        upstream_host,
        prefix,
        port,
      } => Protocol::PathFront(PathFront::new(
        upstream_host,
        prefix,
        MasqueradeDialer::new(model.masquerades().to_vec(), model.cas(), *port, connector())?,
      )),
      ProtocolConfig::Direct => Protocol::Direct(Direct::new(connector())?),
    })
  }

  fn inner(&self) -> &dyn HostSpoofing {
    match self {
      Protocol::HeaderFront(p) => p,
      Protocol::PathFront(p) => p,
      Protocol::Direct(p) => p,
    }
  }
}

#[async_trait::async_trait]
impl HostSpoofing for Protocol {
  fn rewrite_request(&self, parts: &mut request::Parts) -> Result<()> {
    self.inner().rewrite_request(parts)
  }
  fn rewrite_response(&self, parts: &mut response::Parts) {
    self.inner().rewrite_response(parts)
  }
  fn recover_request(&self, parts: &mut request::Parts) -> Result<()> {
    self.inner().recover_request(parts)
  }
  async fn dial(&self, target: &Target) -> Result<Socket> {
    self.inner().dial(target).await
  }
}

/// Dials a random masquerade by IP, presenting its domain as SNI and
/// verifying the chain against the trusted CAs only.
pub struct MasqueradeDialer {
  masquerades: Vec<Masquerade>,
  port: u16,
  connector: Connector,
}

impl MasqueradeDialer {
  /// Create a dialer over `masquerades` trusting `cas`.
  pub fn new(
    masquerades: Vec<Masquerade>,
    cas: &[CaStat],
    port: u16,
    connector: crate::connector::ConnectorBuilder,
  ) -> Result<Self> {
    let certs = cas
      .iter()
      .map(|ca| Certificate::from_escaped_pem(&ca.cert))
      .collect::<Result<Vec<_>>>()?;
    let roots = TrustedRoots::from_certificates(certs)?;
    if masquerades.is_empty() {
      tracing::warn!("no masquerades configured, fronted requests will fail");
    }
    Ok(Self {
      masquerades,
      port,
      connector: connector.roots(roots).build()?,
    })
  }

  /// A random masquerade.
  pub fn pick(&self) -> Option<&Masquerade> {
    self.masquerades.choose(&mut rand::thread_rng())
  }

  /// Connect and complete the TLS handshake with a random masquerade.
  pub async fn dial(&self) -> Result<Socket> {
    let masquerade = self
      .pick()
      .ok_or_else(|| Error::connection_error("no masquerades available"))?;
    let ip: IpAddr = masquerade.ip_address.parse().map_err(|_| {
      Error::connection_error(format!("bad address {} for {}", masquerade.ip_address, masquerade.domain))
    })?;
    tracing::debug!("dialing masquerade {} at {}", masquerade.domain, ip);
    let socket = self
      .connector
      .connect_with_addr(SocketAddr::new(ip, self.port))
      .await?;
    self.connector.upgrade_to_tls(socket, &masquerade.domain).await
  }
}

/// Scheme and authority a request is really for.
///
/// Absolute-form URIs carry both; origin-form requests fall back to the Host
/// header over plain HTTP.
pub(crate) fn original_target(parts: &request::Parts) -> Result<(String, String)> {
  if let Some(authority) = parts.uri.authority() {
    let scheme = parts.uri.scheme_str().unwrap_or("http");
    return Ok((scheme.to_string(), authority.to_string()));
  }
  let host = parts
    .headers
    .get(HOST)
    .and_then(|h| h.to_str().ok())
    .ok_or_else(|| Error::invalid_request("request has no host"))?;
  Ok(("http".to_string(), host.to_string()))
}

pub(crate) fn path_and_query(uri: &Uri) -> String {
  uri
    .path_and_query()
    .map(PathAndQuery::as_str)
    .unwrap_or("/")
    .to_string()
}

/// Point `parts` at `scheme://authority` + `path`, with a matching Host header.
pub(crate) fn retarget(parts: &mut request::Parts, scheme: &str, authority: &str, path: &str) -> Result<()> {
  parts.uri = Uri::builder()
    .scheme(scheme)
    .authority(authority)
    .path_and_query(path)
    .build()?;
  parts.headers.insert(HOST, HeaderValue::from_str(authority)?);
  Ok(())
}

pub(crate) fn strip_cdn_headers(parts: &mut response::Parts) {
  for name in CDN_RESPONSE_HEADERS {
    parts.headers.remove(*name);
  }
}
