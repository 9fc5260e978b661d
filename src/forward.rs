//! Reverse-proxy forwarding engine.
//!
//! Each request passes through a director that rewrites it in place and
//! picks a [`Route`], is sent over a connection opened by the dial hook, and
//! comes back through the response hook. Response bodies are pumped to the
//! client by a separate task which coalesces data between flushes.

use crate::errors::{Error, Result};
use crate::protocol::Target;
use crate::socket::Socket;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST};
use http::{request, response, Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Body type of every response the engine produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, Error>;

/// Rewrites a request in place and decides how it travels.
pub type Director = Arc<dyn Fn(&mut request::Parts) -> Result<Route> + Send + Sync>;
/// Rewrites a response head in place.
pub type ModifyResponse = Arc<dyn Fn(Route, &mut response::Parts) + Send + Sync>;
/// Opens the upstream connection for a request.
pub type Dial = Arc<dyn Fn(Route, Target) -> BoxFuture<'static, Result<Socket>> + Send + Sync>;

/// Hop-by-hop headers, never forwarded.
const HOP_HEADERS: &[&str] = &[
  "connection",
  "proxy-connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// How a request leaves the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
  /// Disguised through the host-spoofing protocol
  Fronted,
  /// Straight to its real host
  Direct,
}

/// ReverseProxyBuilder
pub struct ReverseProxyBuilder {
  director: Director,
  modify_response: ModifyResponse,
  dial: Option<Dial>,
  flush_interval: Duration,
}

impl Default for ReverseProxyBuilder {
  fn default() -> Self {
    Self {
      director: Arc::new(|_| Ok(Route::Direct)),
      modify_response: Arc::new(|_, _| {}),
      dial: None,
      flush_interval: Duration::from_millis(100),
    }
  }
}

impl ReverseProxyBuilder {
  /// Set the request hook.
  pub fn director<F>(mut self, director: F) -> Self
  where
    F: Fn(&mut request::Parts) -> Result<Route> + Send + Sync + 'static,
  {
    self.director = Arc::new(director);
    self
  }
  /// Set the response hook.
  pub fn modify_response<F>(mut self, modify: F) -> Self
  where
    F: Fn(Route, &mut response::Parts) + Send + Sync + 'static,
  {
    self.modify_response = Arc::new(modify);
    self
  }
  /// Set the dial hook. Required.
  pub fn dial<F>(mut self, dial: F) -> Self
  where
    F: Fn(Route, Target) -> BoxFuture<'static, Result<Socket>> + Send + Sync + 'static,
  {
    self.dial = Some(Arc::new(dial));
    self
  }
  /// How long body data may be held before it is flushed to the client.
  /// Zero flushes every chunk as it arrives.
  ///
  /// Default is 100 milliseconds. Event streams are always flushed immediately.
  pub fn flush_interval(mut self, interval: Duration) -> Self {
    self.flush_interval = interval;
    self
  }
  /// Build the engine.
  pub fn build(self) -> Result<ReverseProxy> {
    let dial = self
      .dial
      .ok_or_else(|| Error::config_error("reverse proxy needs a dial function"))?;
    Ok(ReverseProxy {
      director: self.director,
      modify_response: self.modify_response,
      dial,
      flush_interval: self.flush_interval,
    })
  }
}

/// The forwarding engine.
#[derive(Clone)]
pub struct ReverseProxy {
  director: Director,
  modify_response: ModifyResponse,
  dial: Dial,
  flush_interval: Duration,
}

impl ReverseProxy {
  /// Create a `ReverseProxyBuilder`.
  pub fn builder() -> ReverseProxyBuilder {
    ReverseProxyBuilder::default()
  }

  /// Forward `req`, answering with a 4xx/5xx response when it cannot be.
  pub async fn serve<B>(&self, req: Request<B>) -> Response<ProxyBody>
  where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
  {
    let uri = req.uri().clone();
    match self.forward(req).await {
      Ok(response) => response,
      Err(e) => {
        tracing::warn!("unable to forward {}: {}", uri, e);
        let status = match e {
          Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
          _ => StatusCode::BAD_GATEWAY,
        };
        error_response(status, &e.to_string())
      }
    }
  }

  async fn forward<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>>
  where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
  {
    let (mut parts, body) = req.into_parts();
    remove_hop_headers(&mut parts.headers);
    let route = (self.director)(&mut parts)?;
    let target = Target::from_uri(&parts.uri)?;
    if !parts.headers.contains_key(HOST) {
      parts.headers.insert(HOST, HeaderValue::from_str(&target.authority())?);
    }
    parts.uri = origin_form(&parts.uri)?;

    let socket = (self.dial)(route, target.clone()).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(socket)).await?;
    let authority = target.authority();
    tokio::spawn(async move {
      if let Err(e) = conn.await {
        tracing::debug!("upstream connection to {} ended: {}", authority, e);
      }
    });

    let response = sender.send_request(Request::from_parts(parts, body)).await?;
    let (mut parts, body) = response.into_parts();
    remove_hop_headers(&mut parts.headers);
    (self.modify_response)(route, &mut parts);
    let interval = flush_interval_for(&parts.headers, self.flush_interval);
    Ok(Response::from_parts(parts, pump(body, interval)))
  }
}

/// Flush cadence for a response: event streams are flushed per chunk.
pub fn flush_interval_for(headers: &HeaderMap, default: Duration) -> Duration {
  let streaming = headers
    .get(CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.trim_start().starts_with("text/event-stream"));
  if streaming {
    Duration::ZERO
  } else {
    default
  }
}

/// Drop hop-by-hop headers, including any named by `Connection`.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
  let named: Vec<HeaderName> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
    .collect();
  for name in named {
    headers.remove(name);
  }
  for name in HOP_HEADERS {
    headers.remove(*name);
  }
}

fn origin_form(uri: &Uri) -> Result<Uri> {
  let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  Ok(path.parse()?)
}

/// A plain-text response for requests that could not be forwarded.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
  let mut response = Response::new(full(Bytes::from(message.to_string())));
  *response.status_mut() = status;
  response
}

/// A complete in-memory body.
pub fn full(bytes: Bytes) -> ProxyBody {
  Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// An empty body.
pub fn empty() -> ProxyBody {
  full(Bytes::new())
}

type Chunk = std::result::Result<Frame<Bytes>, Error>;

fn pump(mut body: Incoming, interval: Duration) -> ProxyBody {
  let (tx, rx) = mpsc::channel::<Chunk>(16);
  tokio::spawn(async move {
    let mut ticker = (!interval.is_zero()).then(|| {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      ticker
    });
    let mut pending = BytesMut::new();
    loop {
      let frame = tokio::select! {
        _ = tx.closed() => {
          tracing::debug!("client went away, abandoning response body");
          return;
        }
        _ = tick(&mut ticker) => {
          if !pending.is_empty() && tx.send(Ok(Frame::data(pending.split().freeze()))).await.is_err() {
            return;
          }
          continue;
        }
        frame = body.frame() => frame,
      };
      match frame {
        None => break,
        Some(Err(e)) => {
          flush(&tx, &mut pending).await;
          let _ = tx.send(Err(Error::from(e))).await;
          return;
        }
        Some(Ok(frame)) => match frame.into_data() {
          Ok(data) if ticker.is_some() => pending.extend_from_slice(&data),
          Ok(data) => {
            if tx.send(Ok(Frame::data(data))).await.is_err() {
              return;
            }
          }
          Err(trailers) => {
            flush(&tx, &mut pending).await;
            if tx.send(Ok(trailers)).await.is_err() {
              return;
            }
          }
        },
      }
    }
    flush(&tx, &mut pending).await;
  });
  let frames = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) });
  StreamBody::new(frames).boxed_unsync()
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
  match ticker {
    Some(ticker) => {
      ticker.tick().await;
    }
    None => std::future::pending::<()>().await,
  }
}

async fn flush(tx: &mpsc::Sender<Chunk>, pending: &mut BytesMut) {
  if !pending.is_empty() {
    let _ = tx.send(Ok(Frame::data(pending.split().freeze()))).await;
  }
}
