//! Stub upstreams and a proxy wired to them.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use viperscan::{
  codec, CertificateAuthority, HttpRequest, HttpResponse, Limits, Method, StatusCode, ViperConfig,
  ViperProxy,
};

pub type Handler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// A stub target that records every request it answers.
pub struct Upstream {
  pub addr: SocketAddr,
  seen: Arc<Mutex<Vec<HttpRequest>>>,
}

impl Upstream {
  pub fn requests(&self) -> Vec<HttpRequest> {
    self.seen.lock().unwrap().clone()
  }
}

/// `200 text/plain` with the query string echoed in `X-Echo`.
pub fn echo() -> Handler {
  Arc::new(|request: &HttpRequest| {
    let query = request.target.split_once('?').map(|(_, q)| q).unwrap_or("");
    HttpResponse::with_body(StatusCode::OK, "text/plain", format!("saw {}\n", request.method))
      .header("X-Echo", query)
  })
}

/// Answers `status` with a fixed body.
pub fn fixed(status: u16, body: &'static str) -> Handler {
  Arc::new(move |_: &HttpRequest| {
    HttpResponse::with_body(StatusCode::from_u16(status).unwrap(), "text/plain", body)
  })
}

pub async fn upstream(handler: Handler) -> Upstream {
  spawn_upstream(handler, None).await
}

/// A TLS stub presenting a certificate for `test.local` issued from a
/// throwaway root in `name`'s temp dir.
pub async fn tls_upstream(name: &str, handler: Handler) -> Upstream {
  let ca = CertificateAuthority::new(temp_dir(name)).await.unwrap();
  let leaf = ca.issue_leaf("test.local").unwrap();
  let config = rustls::ServerConfig::builder_with_provider(Arc::new(
    rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .unwrap()
  .with_no_client_auth()
  .with_single_cert(leaf.cert_chain.clone(), leaf.key.clone_key())
  .unwrap();
  spawn_upstream(handler, Some(TlsAcceptor::from(Arc::new(config)))).await
}

async fn spawn_upstream(handler: Handler, tls: Option<TlsAcceptor>) -> Upstream {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let log = seen.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let handler = handler.clone();
      let log = log.clone();
      let tls = tls.clone();
      tokio::spawn(async move {
        match tls {
          Some(acceptor) => {
            if let Ok(stream) = acceptor.accept(stream).await {
              answer(stream, handler, log).await;
            }
          }
          None => answer(stream, handler, log).await,
        }
      });
    }
  });
  Upstream { addr, seen }
}

async fn answer<S>(stream: S, handler: Handler, log: Arc<Mutex<Vec<HttpRequest>>>)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut reader = BufReader::new(stream);
  while let Ok(Some(request)) = codec::read_request(&mut reader, Limits::default()).await {
    let response = handler(&request);
    log.lock().unwrap().push(request.clone());
    if reader.write_all(&response.to_raw()).await.is_err() {
      break;
    }
    let _ = reader.flush().await;
    if !request.wants_keep_alive() {
      break;
    }
  }
  let _ = reader.shutdown().await;
}

/// A fresh, empty directory under the system temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("viperscan-test-{}", name));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

pub fn cleanup(name: &str) {
  std::fs::remove_dir_all(std::env::temp_dir().join(format!("viperscan-test-{}", name))).ok();
}

/// A proxy listening on an ephemeral port with `test.local` pointed at `target`.
pub async fn proxy(
  name: &str,
  target: SocketAddr,
  tweak: impl FnOnce(&mut ViperConfig),
) -> (Arc<ViperProxy>, SocketAddr) {
  let mut config = ViperConfig::default();
  config.ca_storage_path = temp_dir(name);
  config.host_overrides.insert("test.local".to_string(), target);
  tweak(&mut config);
  let proxy = Arc::new(ViperProxy::new(config).await.unwrap());
  let server = proxy.bind_to("127.0.0.1:0".parse().unwrap()).await.unwrap();
  let addr = server.local_addr().unwrap();
  tokio::spawn(server.run());
  (proxy, addr)
}

/// A client connection to the proxy.
pub struct Client {
  reader: BufReader<TcpStream>,
}

impl Client {
  pub async fn connect(proxy: SocketAddr) -> Self {
    let stream = TcpStream::connect(proxy).await.unwrap();
    Self {
      reader: BufReader::new(stream),
    }
  }

  pub async fn send(&mut self, raw: &str) {
    self.reader.write_all(raw.as_bytes()).await.unwrap();
    self.reader.flush().await.unwrap();
  }

  /// The next response, or `None` when the proxy closed the connection.
  pub async fn response(&mut self) -> Option<HttpResponse> {
    codec::read_response(&mut self.reader, &Method::GET, Limits::default())
      .await
      .ok()
  }

  pub fn into_inner(self) -> BufReader<TcpStream> {
    self.reader
  }
}

/// Send one request on a new connection and read the reply.
pub async fn fetch(proxy: SocketAddr, raw: &str) -> Option<HttpResponse> {
  let mut client = Client::connect(proxy).await;
  client.send(raw).await;
  client.response().await
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = bool>,
{
  for _ in 0..200 {
    if check().await {
      return true;
    }
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
  }
  false
}

/// Accepts connections and never answers. Returns the address and a count of
/// accepted connections.
pub async fn silent_upstream() -> (SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
  let count = accepted.clone();
  tokio::spawn(async move {
    let mut held = Vec::new();
    while let Ok((stream, _)) = listener.accept().await {
      count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
      held.push(stream);
    }
  });
  (addr, accepted)
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  listener.local_addr().unwrap()
}

/// Wait until `count` messages are held and return them in arrival order.
pub async fn held(proxy: &ViperProxy, count: usize) -> Vec<viperscan::PendingIntercept> {
  for _ in 0..200 {
    let pending = proxy.pending_intercepts().await;
    if pending.len() >= count {
      return pending;
    }
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
  }
  panic!("expected {} held messages", count);
}
