use super::{original_target, path_and_query, retarget, strip_cdn_headers, HostSpoofing, MasqueradeDialer, Target};
use crate::errors::{Error, Result};
use crate::socket::Socket;
use http::{request, response};

/// Fronting that encodes the real scheme and authority as leading path
/// segments under a fixed prefix: `/prefix/https/example.com:8443/rest`.
pub struct PathFront {
  upstream_host: String,
  prefix: String,
  dialer: MasqueradeDialer,
}

impl PathFront {
  /// Front requests to `upstream_host` under `prefix` through `dialer`.
  pub fn new(upstream_host: impl Into<String>, prefix: &str, dialer: MasqueradeDialer) -> Self {
    let prefix = format!("/{}", prefix.trim_matches('/'));
    Self {
      upstream_host: upstream_host.into(),
      prefix: if prefix == "/" { String::new() } else { prefix },
      dialer,
    }
  }
}

#[async_trait::async_trait]
impl HostSpoofing for PathFront {
  fn rewrite_request(&self, parts: &mut request::Parts) -> Result<()> {
    let (scheme, authority) = original_target(parts)?;
    let path = format!("{}/{}/{}{}", self.prefix, scheme, authority, path_and_query(&parts.uri));
    retarget(parts, "https", &self.upstream_host, &path)
  }

  fn rewrite_response(&self, parts: &mut response::Parts) {
    strip_cdn_headers(parts);
  }

  fn recover_request(&self, parts: &mut request::Parts) -> Result<()> {
    let full = path_and_query(&parts.uri);
    let rest = full
      .strip_prefix(self.prefix.as_str())
      .and_then(|rest| rest.strip_prefix('/'))
      .ok_or_else(|| Error::invalid_request(format!("{} is not under {}", full, self.prefix)))?;
    let (scheme, rest) = rest
      .split_once('/')
      .ok_or_else(|| Error::invalid_request(format!("no scheme segment in {}", full)))?;
    let split = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, path) = rest.split_at(split);
    if authority.is_empty() {
      return Err(Error::invalid_request(format!("no host segment in {}", full)));
    }
    let path = match path {
      "" => "/".to_string(),
      p if p.starts_with('?') => format!("/{}", p),
      p => p.to_string(),
    };
    retarget(parts, scheme, authority, &path)
  }

  async fn dial(&self, target: &Target) -> Result<Socket> {
    tracing::trace!("fronting {} via masquerade", target.authority());
    self.dialer.dial().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connector::Connector;
  use http::header::HOST;

  fn protocol(prefix: &str) -> PathFront {
    let dialer = MasqueradeDialer::new(vec![], &[], 443, Connector::builder()).unwrap();
    PathFront::new("proxy.example.net", prefix, dialer)
  }

  fn parts(uri: &str) -> request::Parts {
    http::Request::get(uri).body(()).unwrap().into_parts().0
  }

  #[test]
  fn rewrite_then_recover_restores_target() {
    let front = protocol("/fronted/");
    let mut p = parts("https://news.example/a/b?c=d");
    front.rewrite_request(&mut p).unwrap();
    assert_eq!(
      p.uri.to_string(),
      "https://proxy.example.net/fronted/https/news.example/a/b?c=d"
    );
    assert_eq!(p.headers[HOST], "proxy.example.net");
    front.recover_request(&mut p).unwrap();
    assert_eq!(p.uri.to_string(), "https://news.example/a/b?c=d");
    assert_eq!(p.headers[HOST], "news.example");
  }

  #[test]
  fn root_path_and_bare_query_survive() {
    let front = protocol("");
    for uri in ["http://news.example:8080/", "http://news.example/?q=1"] {
      let mut p = parts(uri);
      front.rewrite_request(&mut p).unwrap();
      front.recover_request(&mut p).unwrap();
      assert_eq!(p.uri.to_string(), uri);
    }
  }

  #[test]
  fn foreign_paths_are_rejected() {
    let front = protocol("/fronted");
    assert!(front.recover_request(&mut parts("https://proxy.example.net/other/https/x")).is_err());
    assert!(front.recover_request(&mut parts("https://proxy.example.net/fronted/https")).is_err());
  }
}
