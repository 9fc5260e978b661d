use super::{HostSpoofing, Target};
use crate::connector::{Connector, ConnectorBuilder};
use crate::errors::Result;
use crate::socket::Socket;
use crate::tls::TrustedRoots;
use http::{request, response};

/// No fronting: requests go unchanged to their real host, verified against
/// the platform roots.
pub struct Direct {
  connector: Connector,
}

impl Direct {
  /// Create from a connector configuration; roots are the platform's.
  pub fn new(builder: ConnectorBuilder) -> Result<Self> {
    let roots = TrustedRoots::native().unwrap_or_else(|e| {
      tracing::warn!("direct connections will not verify TLS peers: {}", e);
      TrustedRoots::from_der(Vec::new())
    });
    Ok(Self {
      connector: builder.roots(roots).build()?,
    })
  }
}

#[async_trait::async_trait]
impl HostSpoofing for Direct {
  fn rewrite_request(&self, _parts: &mut request::Parts) -> Result<()> {
    Ok(())
  }

  fn rewrite_response(&self, _parts: &mut response::Parts) {}

  fn recover_request(&self, _parts: &mut request::Parts) -> Result<()> {
    Ok(())
  }

  async fn dial(&self, target: &Target) -> Result<Socket> {
    let socket = self.connector.connect_with_host(&target.host, target.port).await?;
    if target.tls {
      return self.connector.upgrade_to_tls(socket, &target.host).await;
    }
    Ok(socket)
  }
}
