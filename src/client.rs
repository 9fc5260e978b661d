//! Intercepting proxy client
//!
//! Accepts plain HTTP proxy requests and HTTPS `CONNECT` tunnels. Tunnels are
//! terminated with a leaf issued by the local root, and every decrypted
//! request is forwarded through the same engine as plain HTTP.

use crate::ca::{CertContext, ManualTrustStore, TrustStore};
use crate::config::ClientConfig;
use crate::errors::{Error, Result};
use crate::filter::DomainSet;
use crate::forward::{empty, error_response, ProxyBody, ReverseProxy, Route};
use crate::protocol::{original_target, retarget, Direct, HostSpoofing, Protocol, Target};
use crate::connector::Connector;
use crate::socket::Socket;
use http::uri::Authority;
use http::{request, HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Builder for [`ProxyClient`].
pub struct ProxyClientBuilder {
  config: ClientConfig,
  trust_store: Arc<dyn TrustStore>,
  protocol: Option<Arc<dyn HostSpoofing>>,
}

impl ProxyClientBuilder {
  /// Trust store the local root is installed into.
  ///
  /// Default is [`ManualTrustStore`].
  pub fn trust_store(mut self, store: Arc<dyn TrustStore>) -> Self {
    self.trust_store = store;
    self
  }

  /// Use `protocol` instead of the one named in the config.
  pub fn protocol(mut self, protocol: Arc<dyn HostSpoofing>) -> Self {
    self.protocol = Some(protocol);
    self
  }

  /// Prepare the root, the trust store and the forwarding engine.
  ///
  /// Every failure here is fatal; nothing has been bound yet.
  pub async fn build(self) -> Result<ProxyClient> {
    let config = Arc::new(self.config);
    let certs = Arc::new(
      CertContext::ensure_root(&config.ca_storage_path)
        .await
        .map_err(|e| Error::config_error(format!("unable to init root certificate: {}", e)))?,
    );
    if let Err(e) = certs.install_if_necessary(self.trust_store.as_ref()) {
      tracing::warn!(
        "unable to install root certificate, intercepted HTTPS will not be trusted: {}",
        e
      );
    }
    let protocol: Arc<dyn HostSpoofing> = match self.protocol {
      Some(protocol) => protocol,
      None => Arc::new(Protocol::from_config(&config)?),
    };
    let passthrough: Arc<dyn HostSpoofing> = Arc::new(Direct::new(
      Connector::builder()
        .nodelay(true)
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.read_timeout())
        .write_timeout(config.write_timeout()),
    )?);
    let engine = build_reverse_proxy(&config, protocol, passthrough)?;
    Ok(ProxyClient {
      config,
      certs,
      engine,
    })
  }
}

/// The local proxy.
#[derive(Clone)]
pub struct ProxyClient {
  config: Arc<ClientConfig>,
  certs: Arc<CertContext>,
  engine: ReverseProxy,
}

impl ProxyClient {
  /// Start configuring a proxy.
  pub fn builder(config: ClientConfig) -> ProxyClientBuilder {
    ProxyClientBuilder {
      config,
      trust_store: Arc::new(ManualTrustStore),
      protocol: None,
    }
  }

  /// Certificate context terminating intercepted HTTPS.
  pub fn certs(&self) -> &Arc<CertContext> {
    &self.certs
  }

  /// Bind the configured address and serve forever.
  pub async fn run(&self) -> Result<()> {
    let addr = &self.config.listen_addr;
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::config_error(format!("failed to bind to {}: {}", addr, e)))?;
    tracing::info!("proxy listening on {}", listener.local_addr()?);
    self.serve(listener).await
  }

  /// Serve connections accepted on `listener`.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let this = self.clone();
          tokio::spawn(async move {
            if let Err(e) = this.handle_connection(stream, peer_addr).await {
              tracing::debug!("connection from {} failed: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept connection: {}", e);
        }
      }
    }
  }

  async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    tracing::trace!("accepted connection from {}", peer_addr);
    let socket = Socket::from_tcp(stream, self.config.read_timeout(), self.config.write_timeout());
    let this = self.clone();
    let service = service_fn(move |req: Request<Incoming>| {
      let this = this.clone();
      async move { Ok::<_, Infallible>(this.handle_request(req).await) }
    });
    http1::Builder::new()
      .timer(TokioTimer::new())
      .serve_connection(TokioIo::new(socket), service)
      .with_upgrades()
      .await?;
    Ok(())
  }

  async fn handle_request(&self, req: Request<Incoming>) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
      return self.handle_connect(req);
    }
    self.engine.serve(req).await
  }

  /// Answer the `CONNECT` and take over the tunnel once hyper hands it back.
  fn handle_connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
      return error_response(StatusCode::BAD_REQUEST, "CONNECT needs host:port");
    };
    let this = self.clone();
    tokio::spawn(async move {
      match hyper::upgrade::on(req).await {
        Ok(upgraded) => {
          if let Err(e) = this.accept_tls_and_handle(upgraded, authority.clone()).await {
            tracing::debug!("intercepted session for {} failed: {}", authority, e);
          }
        }
        Err(e) => tracing::debug!("CONNECT upgrade for {} failed: {}", authority, e),
      }
    });
    Response::new(empty())
  }

  async fn accept_tls_and_handle(&self, upgraded: Upgraded, authority: Authority) -> Result<()> {
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    let leaf = self.certs.issue_leaf(host).await?;
    let acceptor = TlsAcceptor::from(Arc::new(leaf.server_config()?));
    let tls = acceptor.accept(TokioIo::new(upgraded)).await.map_err(|e| {
      Error::connection_error(format!("client TLS handshake for {} failed: {}", authority, e))
    })?;
    let this = self.clone();
    let service = service_fn(move |mut req: Request<Incoming>| {
      let this = this.clone();
      let authority = authority.clone();
      async move {
        let response = match absolute_https(req.uri(), &authority) {
          Ok(uri) => {
            *req.uri_mut() = uri;
            this.engine.serve(req).await
          }
          Err(e) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        Ok::<_, Infallible>(response)
      }
    });
    http1::Builder::new()
      .timer(TokioTimer::new())
      .serve_connection(TokioIo::new(tls), service)
      .await?;
    Ok(())
  }
}

/// Build the engine: route, rewrite through `protocol` or pass straight
/// through `passthrough`, and dump headers when asked to.
fn build_reverse_proxy(
  config: &ClientConfig,
  protocol: Arc<dyn HostSpoofing>,
  passthrough: Arc<dyn HostSpoofing>,
) -> Result<ReverseProxy> {
  let should_proxy_loopback = config.should_proxy_loopback;
  let dump = config.should_dump_headers;
  let proxied_sites = Arc::new(config.proxied_sites.clone());

  let director_protocol = protocol.clone();
  let response_protocol = protocol.clone();
  ReverseProxy::builder()
    .flush_interval(config.flush_interval())
    .director(move |parts: &mut request::Parts| {
      let (scheme, authority) = original_target(parts)?;
      if parts.uri.authority().is_none() {
        let path = crate::protocol::path_and_query(&parts.uri);
        retarget(parts, &scheme, &authority, &path)?;
      }
      let route = route_for(host_of(&authority), should_proxy_loopback, &proxied_sites);
      if route == Route::Fronted {
        director_protocol.rewrite_request(parts)?;
      }
      if dump {
        dump_headers("Request", &parts.headers);
      }
      Ok(route)
    })
    .modify_response(move |route, parts| {
      if route == Route::Fronted {
        response_protocol.rewrite_response(parts);
      }
      if dump {
        dump_headers("Response", &parts.headers);
      }
    })
    .dial(move |route, target: Target| {
      let dialer = match route {
        Route::Fronted => protocol.clone(),
        Route::Direct => passthrough.clone(),
      };
      Box::pin(async move { dialer.dial(&target).await })
    })
    .build()
}

/// Loopback hosts pass through unless asked otherwise; with a non-empty
/// proxied-sites set only listed sites are fronted.
fn route_for(host: &str, should_proxy_loopback: bool, proxied_sites: &DomainSet) -> Route {
  if !should_proxy_loopback && is_loopback(host) {
    return Route::Direct;
  }
  if !proxied_sites.is_empty() && !proxied_sites.matches(host) {
    return Route::Direct;
  }
  Route::Fronted
}

/// Whether `host` names the local machine.
///
/// Only the literal forms are recognised: `localhost` and its subdomains,
/// loopback IPs and IPv4-mapped loopback such as `::ffff:127.0.0.1`. Names are
/// never resolved, so a public name pointing at 127.0.0.1 is still fronted.
pub fn is_loopback(host: &str) -> bool {
  let host = host.trim_start_matches('[').trim_end_matches(']').trim_end_matches('.');
  if host.eq_ignore_ascii_case("localhost") || host.to_ascii_lowercase().ends_with(".localhost") {
    return true;
  }
  match host.parse::<IpAddr>() {
    Ok(IpAddr::V6(ip)) => {
      ip.is_loopback() || ip.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
    }
    Ok(ip) => ip.is_loopback(),
    Err(_) => false,
  }
}

fn host_of(authority: &str) -> &str {
  if let Some(rest) = authority.strip_prefix('[') {
    return rest.split(']').next().unwrap_or(rest);
  }
  authority.rsplit_once(':').map_or(authority, |(host, _)| host)
}

fn absolute_https(uri: &Uri, authority: &Authority) -> Result<Uri> {
  let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  let authority = match authority.port_u16() {
    Some(443) => authority.host(),
    _ => authority.as_str(),
  };
  Ok(Uri::builder()
    .scheme("https")
    .authority(authority)
    .path_and_query(path)
    .build()?)
}

fn dump_headers(kind: &str, headers: &HeaderMap) {
  let mut dump = String::new();
  for (name, value) in headers {
    dump.push_str(&format!("\n  {}: {}", name, String::from_utf8_lossy(value.as_bytes())));
  }
  tracing::debug!("{} headers:{}", kind, dump);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn loopback_detection_needs_no_dns() {
    for host in [
      "localhost",
      "LOCALHOST",
      "app.localhost",
      "127.0.0.1",
      "127.8.9.10",
      "::1",
      "[::1]",
      "::ffff:127.0.0.1",
      "[::ffff:127.0.0.1]",
    ] {
      assert!(is_loopback(host), "{}", host);
    }
    for host in ["example.com", "10.0.0.1", "localhost.example.com", "::2", "::ffff:10.0.0.1"] {
      assert!(!is_loopback(host), "{}", host);
    }
  }

  #[test]
  fn host_of_strips_port() {
    assert_eq!(host_of("example.com:8080"), "example.com");
    assert_eq!(host_of("example.com"), "example.com");
    assert_eq!(host_of("[::1]:443"), "::1");
  }

  #[test]
  fn routing_respects_loopback_and_proxied_sites() {
    let empty = DomainSet::new();
    assert_eq!(route_for("127.0.0.1", false, &empty), Route::Direct);
    assert_eq!(route_for("127.0.0.1", true, &empty), Route::Fronted);
    assert_eq!(route_for("news.example", false, &empty), Route::Fronted);

    let sites: DomainSet = vec!["news.example".to_string()].into_iter().collect();
    assert_eq!(route_for("www.news.example", false, &sites), Route::Fronted);
    assert_eq!(route_for("other.example", false, &sites), Route::Direct);
  }

  #[test]
  fn tunnel_requests_become_absolute() {
    let authority: Authority = "news.example:443".parse().unwrap();
    let uri = absolute_https(&"/a?b".parse().unwrap(), &authority).unwrap();
    assert_eq!(uri.to_string(), "https://news.example/a?b");
    let authority: Authority = "news.example:8443".parse().unwrap();
    let uri = absolute_https(&"/".parse().unwrap(), &authority).unwrap();
    assert_eq!(uri.to_string(), "https://news.example:8443/");
  }
}
