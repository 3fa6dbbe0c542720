//! Requests addressed to the proxy itself: the landing page, the root
//! certificate downloads and the server-sent event stream.
use crate::ca::CertificateManager;
use crate::errors::Result;
use crate::events::{EventBus, Subscription};
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use http::{Method, StatusCode};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// What the connection should do with a control request.
pub enum ControlReply {
  Response(HttpResponse),
  /// Switch the connection to a server-sent event stream.
  EventStream(Subscription),
}

#[derive(Clone)]
pub struct ControlSurface {
  host: String,
  certs: Arc<CertificateManager>,
  events: EventBus,
}

impl ControlSurface {
  pub fn new(host: impl Into<String>, certs: Arc<CertificateManager>, events: EventBus) -> Self {
    Self {
      host: host.into().to_ascii_lowercase(),
      certs,
      events,
    }
  }

  /// Whether `host` names the control surface.
  pub fn is_control_host(&self, host: &str) -> bool {
    host.eq_ignore_ascii_case(&self.host)
  }

  pub fn handle(&self, request: &HttpRequest, path: &str) -> ControlReply {
    if request.method != Method::GET && request.method != Method::HEAD {
      return ControlReply::Response(
        HttpResponse::with_body(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "GET only\n")
          .header("Allow", "GET, HEAD"),
      );
    }
    let response = match path {
      "/" | "/index.html" => HttpResponse::with_body(
        StatusCode::OK,
        "text/html; charset=utf-8",
        format!(
          "<!DOCTYPE html><html><head><title>ViperScan</title></head><body>\
           <h1>ViperScan proxy</h1>\
           <p>Install the root certificate to intercept HTTPS: \
           <a href=\"http://{host}/ca.pem\">PEM</a> or <a href=\"http://{host}/ca.der\">DER</a>.</p>\
           </body></html>",
          host = self.host
        ),
      ),
      "/ca.pem" => HttpResponse::with_body(
        StatusCode::OK,
        "application/x-pem-file",
        self.certs.ca_cert_pem().to_string(),
      )
      .header("Content-Disposition", "attachment; filename=\"viperscan-ca.pem\""),
      "/ca.der" => HttpResponse::with_body(
        StatusCode::OK,
        "application/x-x509-ca-cert",
        self.certs.ca_cert_der().to_vec(),
      )
      .header("Content-Disposition", "attachment; filename=\"viperscan-ca.der\""),
      "/events" => return ControlReply::EventStream(self.events.subscribe()),
      _ => HttpResponse::with_body(StatusCode::NOT_FOUND, "text/plain", "not found\n"),
    };
    ControlReply::Response(response)
  }
}

/// Write events to `writer` until the bus closes or the client goes away.
pub async fn stream_events<W>(writer: &mut W, mut subscription: Subscription) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let head = HttpResponse::new(StatusCode::OK)
    .header("Content-Type", "text/event-stream")
    .header("Cache-Control", "no-cache")
    .header("Connection", "close");
  writer.write_all(&head.to_raw()).await?;
  writer.flush().await?;
  while let Some(event) = subscription.recv().await {
    let data = serde_json::to_string(&event)?;
    let frame = format!("event: {}\ndata: {}\n\n", event.kind(), data);
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
  }
  Ok(())
}
