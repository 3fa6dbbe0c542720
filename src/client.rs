//! The client path shared by the proxy, repeater, scanner and fuzzer.
use crate::codec::{self, Limits};
use crate::connector::Connector;
use crate::errors::{Error, Result, UpstreamFailure};
use crate::request::{HttpRequest, Url};
use crate::response::HttpResponse;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};

/// Sends one request to its target and returns the response.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, url: &Url, request: &HttpRequest) -> Result<HttpResponse>;
}

/// One connection per request, closed after the response.
#[derive(Clone)]
pub struct UpstreamClient {
  connector: Connector,
  read_timeout: Option<Duration>,
  limits: Limits,
}

impl UpstreamClient {
  pub fn new(connector: Connector, read_timeout: Option<Duration>, limits: Limits) -> Self {
    Self {
      connector,
      read_timeout,
      limits,
    }
  }

  /// The request as it goes on the wire: origin-form target, `Host` for the
  /// target, no hop-by-hop headers and `Connection: close`.
  pub fn outbound(url: &Url, request: &HttpRequest) -> HttpRequest {
    let mut outbound = request.clone();
    outbound.headers.strip_hop_by_hop();
    outbound.headers.remove("expect");
    outbound.target = url.origin_form();
    if !outbound.headers.contains("host") {
      outbound.headers.insert("Host", url.authority());
    }
    outbound.version = http::Version::HTTP_11;
    outbound.sync_content_length();
    outbound.headers.insert("Connection", "close");
    outbound
  }

  async fn exchange(&self, url: &Url, request: &HttpRequest) -> Result<HttpResponse> {
    let mut stream = self.connector.connect(url).await?;
    let raw = Self::outbound(url, request).to_raw();
    let io_failure =
      |e: std::io::Error| Error::upstream(UpstreamFailure::from_io(&e), format!("{}: {}", url, e));
    stream.write_all(&raw).await.map_err(io_failure)?;
    stream.flush().await.map_err(io_failure)?;
    let mut reader = BufReader::new(stream);
    codec::read_response(&mut reader, &request.method, self.limits)
      .await
      .map_err(|e| match e {
        Error::IO(io) => io_failure(io),
        other => Error::upstream(UpstreamFailure::Protocol, format!("{}: {}", url, other)),
      })
  }
}

#[async_trait]
impl Transport for UpstreamClient {
  async fn send(&self, url: &Url, request: &HttpRequest) -> Result<HttpResponse> {
    tracing::debug!(%url, method = %request.method, "sending upstream");
    match self.read_timeout {
      None => self.exchange(url, request).await,
      Some(t) => tokio::time::timeout(t, self.exchange(url, request))
        .await
        .map_err(|_| {
          Error::upstream(
            UpstreamFailure::Timeout,
            format!("{}: no response within {:?}", url, t),
          )
        })?,
    }
  }
}
