use std::future::Future;
use std::io::{Error, ErrorKind};
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::CertificateDer;

/// A TCP or client-TLS stream with per-operation read and write deadlines.
///
/// A deadline is armed when an operation first returns `Pending` and cleared
/// as soon as the operation makes progress, so a stalled peer surfaces as
/// `ErrorKind::TimedOut` instead of holding the task forever.
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  read_deadline: Option<Pin<Box<Sleep>>>,
  write_deadline: Option<Pin<Box<Sleep>>>,
}
impl Socket {
  pub(crate) fn new(
    maybe_tls_stream: MaybeTlsStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self {
      inner: maybe_tls_stream,
      read_timeout,
      write_timeout,
      read_deadline: None,
      write_deadline: None,
    }
  }
  /// Wrap an accepted client connection.
  pub fn from_tcp(
    stream: TcpStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self::new(MaybeTlsStream::Tcp(stream), read_timeout, write_timeout)
  }
  pub(crate) async fn tls<F, Fut>(self, func: F) -> Result<Self, Error>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: Future<Output = Result<TlsStream<TcpStream>, Error>>,
  {
    let inner = match self.inner {
      MaybeTlsStream::Tcp(t) => MaybeTlsStream::Tls(Box::new(func(t).await?)),
      MaybeTlsStream::Tls(t) => MaybeTlsStream::Tls(t),
    };
    Ok(Self::new(inner, self.read_timeout, self.write_timeout))
  }
  /// Whether the stream has been upgraded to TLS.
  pub fn is_tls(&self) -> bool {
    matches!(self.inner, MaybeTlsStream::Tls(_))
  }
}

/// Either a plain TCP stream or a TLS client stream over TCP.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}
impl MaybeTlsStream {
  /// The certificate chain presented by the server, end-entity first.
  ///
  /// Only available once a TLS handshake has completed; the chain has already
  /// been accepted by the connector's verifier.
  pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
    match &self {
      MaybeTlsStream::Tcp(_) => None,
      MaybeTlsStream::Tls(stream) => stream
        .get_ref()
        .1
        .peer_certificates()
        .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect()),
    }
  }
}

fn poll_deadline(
  deadline: &mut Option<Pin<Box<Sleep>>>,
  timeout: Option<Duration>,
  cx: &mut Context<'_>,
  what: &str,
) -> Option<Error> {
  let timeout = timeout?;
  let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
  if sleep.as_mut().poll(cx).is_ready() {
    *deadline = None;
    return Some(Error::new(
      ErrorKind::TimedOut,
      format!("{} timed out after {:?}", what, timeout),
    ));
  }
  None
}

// 实现socket的读写
impl AsyncRead for Socket {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(r) => {
        this.read_deadline = None;
        Poll::Ready(r)
      }
      Poll::Pending => match poll_deadline(&mut this.read_deadline, this.read_timeout, cx, "read") {
        Some(e) => Poll::Ready(Err(e)),
        None => Poll::Pending,
      },
    }
  }
}
impl AsyncWrite for Socket {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_write(cx, buf) {
      Poll::Ready(r) => {
        this.write_deadline = None;
        Poll::Ready(r)
      }
      Poll::Pending => {
        match poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "write") {
          Some(e) => Poll::Ready(Err(e)),
          None => Poll::Pending,
        }
      }
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_flush(cx) {
      Poll::Ready(r) => {
        this.write_deadline = None;
        Poll::Ready(r)
      }
      Poll::Pending => {
        match poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "flush") {
          Some(e) => Poll::Ready(Err(e)),
          None => Poll::Pending,
        }
      }
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}
impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}
impl AsyncWrite for MaybeTlsStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }
  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}
// 直接暴露socket的全部外部接口
impl Deref for MaybeTlsStream {
  type Target = TcpStream;

  fn deref(&self) -> &Self::Target {
    match self {
      MaybeTlsStream::Tcp(s) => s,
      MaybeTlsStream::Tls(t) => t.get_ref().0,
    }
  }
}

// 直接暴露socket的全部外部接口
impl Deref for Socket {
  type Target = MaybeTlsStream;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Socket {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn read_deadline_fires_on_silent_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(2)).await;
      drop(stream);
    });
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut socket = Socket::from_tcp(stream, Some(Duration::from_millis(100)), None);
    let mut buf = [0u8; 8];
    let err = socket.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    peer.abort();
  }

  #[tokio::test]
  async fn data_flows_before_deadline() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      stream.write_all(b"pong").await.unwrap();
    });
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut socket = Socket::from_tcp(stream, Some(Duration::from_secs(5)), None);
    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
    assert!(!socket.is_tls());
  }
}
