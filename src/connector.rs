use crate::errors::{new_io_error, Result};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls::TrustedRoots;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Dial settings shared by probes, masquerade dials and passthrough dials.
#[derive(Clone)]
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  roots: Option<TrustedRoots>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: false,
      roots: None,
    }
  }
}

impl ConnectorBuilder {
  /// Set `TCP_NODELAY` on dialed sockets.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Roots TLS peers are verified against. Without any, every handshake fails.
  pub fn roots(mut self, roots: TrustedRoots) -> ConnectorBuilder {
    self.roots = Some(roots);
    self
  }
  /// Per-read deadline on dialed sockets, reset by every successful read.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Per-write deadline on dialed sockets.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Deadline for resolution plus connect, and separately for the TLS handshake.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }

  /// Build the TLS client config and freeze the settings.
  pub fn build(&self) -> Result<Connector> {
    let roots = self.roots.clone().unwrap_or_else(|| TrustedRoots::from_der(Vec::new()));
    let provider = rustls::crypto::CryptoProvider::get_default()
      .cloned()
      .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
    let tls = rustls::ClientConfig::builder_with_provider(provider)
      .with_safe_default_protocol_versions()
      .map_err(|_| crate::errors::builder("invalid TLS versions"))?
      .with_root_certificates(roots.store())
      .with_no_client_auth();
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      tls: TlsConnector::from(Arc::new(tls)),
    })
  }
}

/// Dials TCP with deadlines and upgrades to verified TLS.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  tls: TlsConnector,
}

impl Connector {
  /// Create a `ConnectorBuilder`.
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }
  /// Dial `addr` directly, no resolution.
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw.set_nonblocking(true)?;
    raw.set_nodelay(self.nodelay)?;
    let socket = TcpSocket::from_std_stream(raw.into());
    let connect = socket.connect(addr);
    let stream = match self.connect_timeout {
      None => connect.await?,
      Some(timeout) => tokio::time::timeout(timeout, connect).await.map_err(|_| {
        new_io_error(std::io::ErrorKind::TimedOut, &format!("connect to {} timed out", addr))
      })??,
    };
    Ok(Socket::new(MaybeTlsStream::Tcp(stream), self.read_timeout, self.write_timeout))
  }
  /// Resolve `host` and connect to the first address that accepts.
  ///
  /// Resolution shares the connect timeout.
  pub async fn connect_with_host(&self, host: &str, port: u16) -> Result<Socket> {
    let lookup = tokio::net::lookup_host((host, port));
    let addrs: Vec<SocketAddr> = match self.connect_timeout {
      None => lookup.await?.collect(),
      Some(timeout) => tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| new_io_error(std::io::ErrorKind::TimedOut, &format!("resolving {} timed out", host)))??
        .collect(),
    };
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(e) => {
          tracing::debug!("connect to {} ({}) failed: {}", host, addr, e);
          last_error = Some(e);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(std::io::ErrorKind::NotFound, &format!("no addresses for {}", host))
    }))
  }
  /// Upgrade `stream` to TLS, presenting `domain` as the server name and
  /// verifying the peer against this connector's roots.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| crate::errors::Error::Other(e.to_string()))?;
    let this = self.tls.clone();
    let handshake = stream.tls(move |t| async move { this.connect(domain, t).await });
    let tls = match self.connect_timeout {
      None => handshake.await?,
      Some(timeout) => tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| new_io_error(std::io::ErrorKind::TimedOut, "tls handshake timed out"))??,
    };
    Ok(tls)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn connect_reports_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let connector = Connector::builder().build().unwrap();
    assert!(connector.connect_with_addr(addr).await.is_err());
  }

  #[tokio::test]
  async fn connect_with_host_resolves_localhost() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connector = Connector::builder()
      .connect_timeout(Some(Duration::from_secs(2)))
      .build()
      .unwrap();
    let socket = connector.connect_with_host("127.0.0.1", port).await.unwrap();
    assert_eq!(socket.peer_addr().unwrap().port(), port);
  }
}
