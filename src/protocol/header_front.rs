use super::{original_target, path_and_query, retarget, strip_cdn_headers, HostSpoofing, MasqueradeDialer, Target};
use crate::errors::{Error, Result};
use crate::socket::Socket;
use http::header::HeaderValue;
use http::{request, response};

/// Header carrying the real `host[:port]`
pub const FRONTED_HOST_HEADER: &str = "x-fronted-host";
/// Header carrying the real scheme
pub const FRONTED_SCHEME_HEADER: &str = "x-fronted-scheme";

/// Fronting that moves the real destination into request headers and
/// addresses the request itself to the upstream proxy.
pub struct HeaderFront {
  upstream_host: String,
  dialer: MasqueradeDialer,
}

impl HeaderFront {
  /// Front requests to `upstream_host` through `dialer`.
  pub fn new(upstream_host: impl Into<String>, dialer: MasqueradeDialer) -> Self {
    Self {
      upstream_host: upstream_host.into(),
      dialer,
    }
  }
}

#[async_trait::async_trait]
impl HostSpoofing for HeaderFront {
  fn rewrite_request(&self, parts: &mut request::Parts) -> Result<()> {
    let (scheme, authority) = original_target(parts)?;
    let path = path_and_query(&parts.uri);
    parts
      .headers
      .insert(FRONTED_HOST_HEADER, HeaderValue::from_str(&authority)?);
    parts
      .headers
      .insert(FRONTED_SCHEME_HEADER, HeaderValue::from_str(&scheme)?);
    retarget(parts, "https", &self.upstream_host, &path)
  }

  fn rewrite_response(&self, parts: &mut response::Parts) {
    strip_cdn_headers(parts);
  }

  fn recover_request(&self, parts: &mut request::Parts) -> Result<()> {
    let host = take_header(parts, FRONTED_HOST_HEADER)?;
    let scheme = take_header(parts, FRONTED_SCHEME_HEADER).unwrap_or_else(|_| "http".to_string());
    let path = path_and_query(&parts.uri);
    retarget(parts, &scheme, &host, &path)
  }

  async fn dial(&self, target: &Target) -> Result<Socket> {
    tracing::trace!("fronting {} via masquerade", target.authority());
    self.dialer.dial().await
  }
}

fn take_header(parts: &mut request::Parts, name: &str) -> Result<String> {
  parts
    .headers
    .remove(name)
    .and_then(|v| v.to_str().ok().map(str::to_string))
    .ok_or_else(|| Error::invalid_request(format!("missing {} header", name)))
}
