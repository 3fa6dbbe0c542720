//! Listener, accept loop and `CONNECT` handling.
use crate::ca::CertificateManager;
use crate::client::Transport;
use crate::codec::Limits;
use crate::connection::{self, Origin, Outcome};
use crate::connector::Connector;
use crate::control::ControlSurface;
use crate::errors::{Error, Result, UpstreamFailure};
use crate::events::EventBus;
use crate::intercept::InterceptQueue;
use crate::message::{Marker, Message, Source};
use crate::request::{HttpRequest, Url};
use crate::response::HttpResponse;
use crate::scan::ScanEngine;
use crate::storage::Storage;
use crate::tls;
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Everything a connection task needs.
pub struct ProxyState {
  pub(crate) limits: Limits,
  pub(crate) https_interception: bool,
  pub(crate) connector: Connector,
  pub(crate) transport: Arc<dyn Transport>,
  pub(crate) intercept: Arc<InterceptQueue>,
  pub(crate) scanner: Arc<ScanEngine>,
  pub(crate) storage: Arc<dyn Storage>,
  pub(crate) events: EventBus,
  pub(crate) control: ControlSurface,
  pub(crate) certs: Arc<CertificateManager>,
  connections: AtomicU64,
}

impl ProxyState {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    limits: Limits,
    https_interception: bool,
    connector: Connector,
    transport: Arc<dyn Transport>,
    intercept: Arc<InterceptQueue>,
    scanner: Arc<ScanEngine>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    control: ControlSurface,
    certs: Arc<CertificateManager>,
  ) -> Self {
    Self {
      limits,
      https_interception,
      connector,
      transport,
      intercept,
      scanner,
      storage,
      events,
      control,
      certs,
      connections: AtomicU64::new(0),
    }
  }

  fn next_connection_id(&self) -> u64 {
    self.connections.fetch_add(1, Ordering::Relaxed) + 1
  }
}

/// A bound proxy listener.
pub struct ProxyServer {
  listener: TcpListener,
  state: Arc<ProxyState>,
}

impl ProxyServer {
  pub async fn bind(addr: SocketAddr, state: Arc<ProxyState>) -> Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "proxy listening");
    Ok(Self { listener, state })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Accept clients until the listener fails. Each client gets its own task.
  pub async fn run(self) -> Result<()> {
    loop {
      let (stream, peer) = self.listener.accept().await?;
      let state = self.state.clone();
      tokio::spawn(async move {
        handle_client(state, stream, peer).await;
      });
    }
  }
}

async fn handle_client(state: Arc<ProxyState>, stream: TcpStream, peer: SocketAddr) {
  let _ = stream.set_nodelay(true);
  let id = state.next_connection_id();
  tracing::debug!(connection = id, %peer, "client connected");
  let result = match connection::serve(&state, stream, Origin::Plain, id).await {
    Ok(Outcome::Closed) => Ok(()),
    Ok(Outcome::Connect {
      request,
      reader,
      sequence,
    }) => tunnel(&state, request, reader, id, sequence).await,
    Err(e) => Err(e),
  };
  match result {
    Ok(()) => tracing::debug!(connection = id, "client disconnected"),
    Err(e) => tracing::debug!(connection = id, error = %e, "connection ended with an error"),
  }
}

/// Answer a `CONNECT`: decrypt and serve the tunnel, or relay it untouched.
async fn tunnel(
  state: &ProxyState,
  request: HttpRequest,
  mut reader: BufReader<TcpStream>,
  id: u64,
  sequence: u64,
) -> Result<()> {
  let url = match Url::parse(&format!("https://{}/", request.target)) {
    Ok(url) if !request.target.contains('/') => url,
    _ => {
      let reply = HttpResponse::with_body(StatusCode::BAD_REQUEST, "text/plain", "bad CONNECT target\n")
        .header("Connection", "close");
      reader.write_all(&reply.to_raw()).await?;
      return Err(Error::protocol(format!("bad CONNECT target {:?}", request.target)));
    }
  };
  if !state.https_interception {
    return relay(state, reader, &url).await;
  }

  let leaf = match state.certs.get_leaf_certificate(&url.host).await {
    Ok(leaf) => leaf,
    Err(e) => {
      // only this host loses interception
      let reply = HttpResponse::with_body(StatusCode::BAD_GATEWAY, "text/plain", format!("{}\n", e))
        .header("Connection", "close");
      reader.write_all(&reply.to_raw()).await?;
      let mut message = Message::new(url, request, Source::Proxy).on_connection(id, sequence);
      message.marker = Marker::Rejected(e.to_string());
      message.response = Some(reply);
      state.record(&message).await;
      return Ok(());
    }
  };

  let mut established = HttpResponse::new(StatusCode::OK);
  established.reason = "Connection Established".to_string();
  reader.write_all(&established.to_raw()).await?;
  reader.flush().await?;

  let config = tls::server_config(leaf.cert_chain.clone(), leaf.key.clone_key())?;
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let stream = acceptor
    .accept(reader)
    .await
    .map_err(|e| Error::protocol(format!("client TLS handshake for {}: {}", url.host, e)))?;
  tracing::debug!(connection = id, host = %url.host, "tunnel decrypted");
  let origin = Origin::Tunnel {
    host: url.host.clone(),
    port: url.port,
  };
  connection::serve(state, stream, origin, id).await?;
  Ok(())
}

/// Copy tunnel bytes in both directions without looking at them.
async fn relay(state: &ProxyState, mut reader: BufReader<TcpStream>, url: &Url) -> Result<()> {
  let connected = match state.connector.resolve(&url.host, url.port).await {
    Ok(addr) => state.connector.connect_with_addr(addr).await,
    Err(e) => Err(e),
  };
  let mut upstream = match connected {
    Ok(stream) => stream,
    Err(e) => {
      let kind = e.upstream_kind().unwrap_or(UpstreamFailure::Io);
      let reply = HttpResponse::upstream_error(kind, &e.to_string());
      reader.write_all(&reply.to_raw()).await?;
      return Ok(());
    }
  };
  let mut established = HttpResponse::new(StatusCode::OK);
  established.reason = "Connection Established".to_string();
  reader.write_all(&established.to_raw()).await?;
  reader.flush().await?;
  let (up, down) = tokio::io::copy_bidirectional(&mut reader, &mut upstream).await?;
  tracing::debug!(host = %url.host, up, down, "tunnel relayed");
  Ok(())
}
