use crate::errors::{Error, Result, UpstreamFailure};
use crate::request::{Scheme, Url};
use crate::socket::MaybeTlsStream;
use crate::tls;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  certs_verification: bool,
  certificate: Vec<CertificateDer<'static>>,
  host_overrides: HashMap<String, SocketAddr>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
      certs_verification: false,
      certificate: vec![],
      host_overrides: HashMap::new(),
    }
  }
}

impl ConnectorBuilder {
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Sets value for the `SO_KEEPALIVE` option on this socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Controls the use of upstream certificate validation.
  ///
  /// Defaults to `false`: the proxy has to reach targets with self-signed certificates.
  pub fn certs_verification(mut self, value: bool) -> ConnectorBuilder {
    self.certs_verification = value;
    self
  }
  /// Adds certificates to the set of roots trusted when verification is on.
  pub fn certificate(mut self, value: Vec<CertificateDer<'static>>) -> ConnectorBuilder {
    self.certificate.extend(value);
    self
  }
  /// Resolve `host` (or `host:port`) to a fixed address instead of using DNS.
  pub fn host_override(mut self, host: impl Into<String>, addr: SocketAddr) -> ConnectorBuilder {
    self.host_overrides.insert(host.into().to_ascii_lowercase(), addr);
    self
  }
  /// Combine the configuration of this builder with a connector to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let tls = tls::client_config(self.certs_verification, &self.certificate)?;
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      host_overrides: self.host_overrides.clone(),
      tls: TlsConnector::from(Arc::new(tls)),
    })
  }
}

/// Opens connections to targets, classifying every failure as an `UpstreamFailure`.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  host_overrides: HashMap<String, SocketAddr>,
  tls: TlsConnector,
}

impl Connector {
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }

  /// Resolve a target, consulting the overrides before DNS.
  pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.to_ascii_lowercase();
    if let Some(addr) = self
      .host_overrides
      .get(&format!("{}:{}", host, port))
      .or_else(|| self.host_overrides.get(&host))
    {
      return Ok(*addr);
    }
    let lookup_host = host.trim_start_matches('[').trim_end_matches(']');
    let mut addrs = tokio::net::lookup_host((lookup_host, port))
      .await
      .map_err(|e| Error::upstream(UpstreamFailure::Dns, format!("{}: {}", host, e)))?;
    addrs
      .next()
      .ok_or_else(|| Error::upstream(UpstreamFailure::Dns, format!("{}: no addresses", host)))
  }

  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr(&self, addr: SocketAddr) -> Result<tokio::net::TcpStream> {
    let io_failure = |e: std::io::Error| {
      Error::upstream(UpstreamFailure::from_io(&e), format!("{}: {}", addr, e))
    };
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
      .map_err(io_failure)?;
    raw_socket.set_nonblocking(true).map_err(io_failure)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay).map_err(io_failure)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive).map_err(io_failure)?;
    }
    let stream = match self.connect_timeout {
      None => socket.connect(addr).await.map_err(io_failure)?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| {
          Error::upstream(
            UpstreamFailure::Timeout,
            format!("connect to {} timed out after {:?}", addr, timeout),
          )
        })?
        .map_err(io_failure)?,
    };
    Ok(stream)
  }

  /// Connect to the origin of `url`, negotiating TLS for `https`.
  pub async fn connect(&self, url: &Url) -> Result<MaybeTlsStream> {
    let addr = self.resolve(&url.host, url.port).await?;
    let stream = self.connect_with_addr(addr).await?;
    match url.scheme {
      Scheme::Http => Ok(MaybeTlsStream::Tcp(stream)),
      Scheme::Https => self.upgrade_to_tls(stream, &url.host).await,
    }
  }

  /// A `Connector` will use transport layer security (TLS) to connect to https destinations.
  pub async fn upgrade_to_tls(
    &self,
    stream: tokio::net::TcpStream,
    domain: &str,
  ) -> Result<MaybeTlsStream> {
    let domain = domain.trim_start_matches('[').trim_end_matches(']');
    let server_name = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::upstream(UpstreamFailure::Tls, format!("{}: {}", domain, e)))?;
    let tls = self
      .tls
      .connect(server_name, stream)
      .await
      .map_err(|e| Error::upstream(UpstreamFailure::Tls, format!("{}: {}", domain, e)))?;
    Ok(MaybeTlsStream::Tls(Box::new(tls)))
  }
}
