use bytes::Bytes;
use fronted::ca::ROOT_COMMON_NAME;
use fronted::protocol::ProtocolConfig;
use fronted::tls::{escape_pem, fingerprint, pem_encode};
use fronted::{CaStat, CertificateAuthority, ClientConfig, Masquerade, ProxyClient};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig as TlsClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(name);
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

fn header(req: &Request<Incoming>, name: &str) -> String {
  req
    .headers()
    .get(name)
    .and_then(|v| v.to_str().ok())
    .unwrap_or("-")
    .to_string()
}

/// Describes what reached it, and tags the answer the way a CDN would.
async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
  let body = format!(
    "{} {} host={} fronted={} scheme={}",
    req.method(),
    req.uri(),
    header(&req, "host"),
    header(&req, "x-fronted-host"),
    header(&req, "x-fronted-scheme"),
  );
  Ok(
    Response::builder()
      .header("content-type", "text/plain")
      .header("cf-ray", "8c1d-LHR")
      .body(Full::new(Bytes::from(body)))
      .unwrap(),
  )
}

/// Plain HTTP origin on loopback.
async fn start_origin() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else { return };
      tokio::spawn(async move {
        let _ = http1::Builder::new()
          .serve_connection(TokioIo::new(stream), service_fn(echo))
          .await;
      });
    }
  });
  addr
}

type StreamedBody = UnsyncBoxBody<Bytes, Infallible>;

/// Plain HTTP origin on loopback answering with a streamed body.
async fn start_streaming_origin<F, Fut>(handler: F) -> SocketAddr
where
  F: Fn(Request<Incoming>) -> Fut + Clone + Send + 'static,
  Fut: Future<Output = Result<Response<StreamedBody>, Infallible>> + Send + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else { return };
      let handler = handler.clone();
      tokio::spawn(async move {
        let _ = http1::Builder::new()
          .serve_connection(TokioIo::new(stream), service_fn(handler))
          .await;
      });
    }
  });
  addr
}

/// Fires once the value holding it is dropped.
struct DropSignal(Option<oneshot::Sender<()>>);

impl Drop for DropSignal {
  fn drop(&mut self) {
    if let Some(tx) = self.0.take() {
      let _ = tx.send(());
    }
  }
}

/// TLS front answering as `localhost`, with a certificate from its own root.
async fn start_front(dir: &Path) -> (u16, CaStat) {
  let ca = CertificateAuthority::new(dir).await.unwrap();
  let (chain, key) = ca.generate_server_cert("localhost").unwrap();
  let config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else { return };
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(tls) = acceptor.accept(stream).await else { return };
        let _ = http1::Builder::new()
          .serve_connection(TokioIo::new(tls), service_fn(echo))
          .await;
      });
    }
  });

  let der = ca.ca_cert_der();
  let stat = CaStat {
    common_name: ROOT_COMMON_NAME.to_string(),
    cert: escape_pem(&pem_encode(der)),
    fingerprint: fingerprint(der),
    occurrences: 1,
    frequency: 100.0,
  };
  (port, stat)
}

fn fronting_config(storage: PathBuf, front_port: u16, ca: CaStat) -> ClientConfig {
  ClientConfig {
    ca_storage_path: storage,
    protocol: ProtocolConfig::HeaderFront {
      upstream_host: "upstream.example".to_string(),
      port: front_port,
    },
    masquerades: vec![Masquerade {
      domain: "localhost".to_string(),
      ip_address: "127.0.0.1".to_string(),
      root_ca: ca.fingerprint.clone(),
    }],
    trusted_cas: vec![ca],
    ..ClientConfig::default()
  }
}

async fn start_proxy(config: ClientConfig) -> (SocketAddr, ProxyClient) {
  let proxy = ProxyClient::builder(config).build().await.unwrap();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let server = proxy.clone();
  tokio::spawn(async move { server.serve(listener).await });
  (addr, proxy)
}

/// Send one absolute-form request through the proxy.
async fn via_proxy(proxy: SocketAddr, uri: &str) -> (StatusCode, http::HeaderMap, String) {
  let stream = TcpStream::connect(proxy).await.unwrap();
  let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
    .await
    .unwrap();
  tokio::spawn(conn);
  let req = Request::builder()
    .uri(uri)
    .body(Empty::<Bytes>::new())
    .unwrap();
  let response = sender.send_request(req).await.unwrap();
  let (parts, body) = response.into_parts();
  let body = body.collect().await.unwrap().to_bytes();
  (parts.status, parts.headers, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn loopback_request_passes_straight_through() {
  let origin = start_origin().await;
  let storage = temp_dir("fronted-it-proxy-loopback");
  let config = ClientConfig {
    ca_storage_path: storage.clone(),
    ..ClientConfig::default()
  };
  let (proxy, _client) = start_proxy(config).await;

  let (status, headers, body) = via_proxy(proxy, &format!("http://{}/hello?x=1", origin)).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body, format!("GET /hello?x=1 host={} fronted=- scheme=-", origin));
  assert!(headers.contains_key("cf-ray"));

  std::fs::remove_dir_all(&storage).ok();
}

#[tokio::test]
async fn plain_http_is_fronted_through_masquerade() {
  let front_dir = temp_dir("fronted-it-proxy-front-ca");
  let storage = temp_dir("fronted-it-proxy-front-store");
  let (front_port, ca) = start_front(&front_dir).await;
  let (proxy, _client) = start_proxy(fronting_config(storage.clone(), front_port, ca)).await;

  let (status, headers, body) = via_proxy(proxy, "http://news.example/story?id=7").await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(
    body,
    "GET /story?id=7 host=upstream.example fronted=news.example scheme=http"
  );
  assert!(!headers.contains_key("cf-ray"));

  std::fs::remove_dir_all(&front_dir).ok();
  std::fs::remove_dir_all(&storage).ok();
}

#[tokio::test]
async fn loopback_is_fronted_when_asked() {
  let origin = start_origin().await;
  let front_dir = temp_dir("fronted-it-proxy-lo-ca");
  let storage = temp_dir("fronted-it-proxy-lo-store");
  let (front_port, ca) = start_front(&front_dir).await;
  let mut config = fronting_config(storage.clone(), front_port, ca);
  config.should_proxy_loopback = true;
  let (proxy, _client) = start_proxy(config).await;

  let (_, _, body) = via_proxy(proxy, &format!("http://{}/", origin)).await;
  assert_eq!(
    body,
    format!("GET / host=upstream.example fronted={} scheme=http", origin)
  );

  std::fs::remove_dir_all(&front_dir).ok();
  std::fs::remove_dir_all(&storage).ok();
}

#[tokio::test]
async fn unreachable_masquerade_is_bad_gateway() {
  let storage = temp_dir("fronted-it-proxy-502");
  let front_dir = temp_dir("fronted-it-proxy-502-ca");
  let (_, ca) = start_front(&front_dir).await;
  let closed = {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
  };
  let (proxy, _client) = start_proxy(fronting_config(storage.clone(), closed, ca)).await;

  let (status, _, _) = via_proxy(proxy, "http://news.example/").await;
  assert_eq!(status, StatusCode::BAD_GATEWAY);

  std::fs::remove_dir_all(&front_dir).ok();
  std::fs::remove_dir_all(&storage).ok();
}

#[tokio::test]
async fn connect_tunnel_is_intercepted_and_fronted() {
  let front_dir = temp_dir("fronted-it-proxy-mitm-ca");
  let storage = temp_dir("fronted-it-proxy-mitm-store");
  let (front_port, ca) = start_front(&front_dir).await;
  let (proxy, client) = start_proxy(fronting_config(storage.clone(), front_port, ca)).await;

  let stream = TcpStream::connect(proxy).await.unwrap();
  let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
    .await
    .unwrap();
  tokio::spawn(conn.with_upgrades());
  let connect = Request::builder()
    .method(Method::CONNECT)
    .uri("news.example:443")
    .body(Empty::<Bytes>::new())
    .unwrap();
  let response = sender.send_request(connect).await.unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  let tunnel = hyper::upgrade::on(response).await.unwrap();

  let mut roots = RootCertStore::empty();
  roots
    .add(client.certs().authority().ca_cert_der().clone())
    .unwrap();
  let tls_config = TlsClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let tls = TlsConnector::from(Arc::new(tls_config))
    .connect(
      ServerName::try_from("news.example").unwrap(),
      TokioIo::new(tunnel),
    )
    .await
    .unwrap();

  let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
    .await
    .unwrap();
  tokio::spawn(conn);
  let req = Request::builder()
    .uri("/inbox")
    .header("host", "news.example")
    .body(Empty::<Bytes>::new())
    .unwrap();
  let response = sender.send_request(req).await.unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  let body = response.into_body().collect().await.unwrap().to_bytes();
  assert_eq!(
    String::from_utf8_lossy(&body),
    "GET /inbox host=upstream.example fronted=news.example scheme=https"
  );
  assert_eq!(client.certs().issued(), 1);

  std::fs::remove_dir_all(&front_dir).ok();
  std::fs::remove_dir_all(&storage).ok();
}

const STALL: Duration = Duration::from_millis(1500);

#[tokio::test]
async fn streamed_chunk_is_flushed_before_origin_stalls() {
  let origin = start_streaming_origin(|_req: Request<Incoming>| async {
    let frames = futures::stream::unfold(0u8, |step| async move {
      let chunk = match step {
        0 => "first",
        1 => {
          tokio::time::sleep(STALL).await;
          "second"
        }
        _ => return None,
      };
      Some((Ok::<_, Infallible>(Frame::data(Bytes::from(chunk))), step + 1))
    });
    Ok::<_, Infallible>(Response::new(StreamBody::new(frames).boxed_unsync()))
  })
  .await;
  let storage = temp_dir("fronted-it-proxy-flush");
  let config = ClientConfig {
    ca_storage_path: storage.clone(),
    flush_interval_ms: 100,
    ..ClientConfig::default()
  };
  let (proxy, _client) = start_proxy(config).await;

  let stream = TcpStream::connect(proxy).await.unwrap();
  let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
    .await
    .unwrap();
  tokio::spawn(conn);
  let req = Request::builder()
    .uri(format!("http://{}/stream", origin))
    .body(Empty::<Bytes>::new())
    .unwrap();
  let started = Instant::now();
  let response = sender.send_request(req).await.unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  let mut body = response.into_body();

  let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
  let first_at = started.elapsed();
  assert_eq!(first, "first");
  assert!(first_at < STALL / 2, "first chunk took {:?}", first_at);

  let mut rest = Vec::new();
  while let Some(frame) = body.frame().await {
    if let Ok(data) = frame.unwrap().into_data() {
      rest.extend_from_slice(&data);
    }
  }
  assert_eq!(rest, b"second");
  assert!(started.elapsed() >= STALL);

  std::fs::remove_dir_all(&storage).ok();
}

#[tokio::test]
async fn client_disconnect_cancels_upstream_body() {
  let (dropped_tx, dropped_rx) = oneshot::channel();
  let signal = Arc::new(Mutex::new(Some(dropped_tx)));
  let origin = start_streaming_origin(move |_req: Request<Incoming>| {
    let guard = DropSignal(signal.lock().unwrap().take());
    async move {
      // endless body; only the client going away ends it
      let frames = futures::stream::unfold((0u64, guard), |(n, guard)| async move {
        if n > 0 {
          tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let chunk = Frame::data(Bytes::from(format!("chunk{}\n", n)));
        Some((Ok::<_, Infallible>(chunk), (n + 1, guard)))
      });
      Ok::<_, Infallible>(Response::new(StreamBody::new(frames).boxed_unsync()))
    }
  })
  .await;
  let storage = temp_dir("fronted-it-proxy-cancel");
  let config = ClientConfig {
    ca_storage_path: storage.clone(),
    flush_interval_ms: 100,
    ..ClientConfig::default()
  };
  let (proxy, _client) = start_proxy(config).await;

  let stream = TcpStream::connect(proxy).await.unwrap();
  let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
    .await
    .unwrap();
  let conn = tokio::spawn(conn);
  let req = Request::builder()
    .uri(format!("http://{}/endless", origin))
    .body(Empty::<Bytes>::new())
    .unwrap();
  let response = sender.send_request(req).await.unwrap();
  let mut body = response.into_body();
  let first = body.frame().await.unwrap().unwrap();
  assert!(first.is_data());

  drop(body);
  drop(sender);
  conn.abort();

  tokio::time::timeout(Duration::from_secs(5), dropped_rx)
    .await
    .expect("origin body still streaming after client left")
    .unwrap();

  std::fs::remove_dir_all(&storage).ok();
}
