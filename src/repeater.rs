//! Re-send captured messages outside the live proxy path.
use crate::client::Transport;
use crate::errors::{Result, UpstreamFailure};
use crate::events::{Event, EventBus};
use crate::message::{Marker, Message, Source};
use crate::request::Url;
use crate::response::HttpResponse;
use crate::scan::ScanEngine;
use crate::storage::Storage;
use http::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Changes applied to a copy of the original request before it is sent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageEdits {
  #[serde(with = "http_serde::option::method")]
  pub method: Option<Method>,
  /// Absolute URL replacing the original target.
  pub url: Option<String>,
  /// Headers replacing any existing values of the same name.
  pub set_headers: Vec<(String, String)>,
  pub remove_headers: Vec<String>,
  pub body: Option<String>,
}

impl MessageEdits {
  pub fn method(mut self, method: Method) -> Self {
    self.method = Some(method);
    self
  }

  pub fn url(mut self, url: impl Into<String>) -> Self {
    self.url = Some(url.into());
    self
  }

  pub fn set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.set_headers.push((name.into(), value.into()));
    self
  }

  pub fn remove_header(mut self, name: impl Into<String>) -> Self {
    self.remove_headers.push(name.into());
    self
  }

  pub fn body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// A new message carrying the edited request. `original` is left untouched.
  pub fn apply(&self, original: &Message) -> Result<Message> {
    let url = match &self.url {
      Some(u) => Url::parse(u)?,
      None => original.url.clone(),
    };
    let mut request = original.request.clone();
    if let Some(method) = &self.method {
      request.method = method.clone();
    }
    if self.url.is_some() {
      request.retarget(&url);
    } else {
      request.target = url.origin_form();
    }
    for name in &self.remove_headers {
      request.headers.remove(name);
    }
    for (name, value) in &self.set_headers {
      request.headers.insert(name.clone(), value.clone());
    }
    if let Some(body) = &self.body {
      request.body = body.clone().into();
      request.headers.insert("Content-Length", request.body.len().to_string());
    }
    Ok(Message::new(url, request, Source::Repeater))
  }
}

/// Stateless apart from the shared storage and event handles.
#[derive(Clone)]
pub struct Repeater {
  transport: Arc<dyn Transport>,
  storage: Arc<dyn Storage>,
  events: EventBus,
  scanner: Option<Arc<ScanEngine>>,
}

impl Repeater {
  pub fn new(transport: Arc<dyn Transport>, storage: Arc<dyn Storage>, events: EventBus) -> Self {
    Self {
      transport,
      storage,
      events,
      scanner: None,
    }
  }

  /// Run passive checks on replayed exchanges.
  pub fn with_scanner(mut self, scanner: Arc<ScanEngine>) -> Self {
    self.scanner = Some(scanner);
    self
  }

  /// Send an edited copy of `original` and record the exchange.
  ///
  /// An unreachable target still yields a message: its response is the
  /// synthetic 502 and its marker names the failure.
  pub async fn replay(&self, original: &Message, edits: &MessageEdits) -> Result<Message> {
    let mut message = edits.apply(original)?;
    let started = Instant::now();
    let sent = self.transport.send(&message.url, &message.request).await;
    message.latency_ms = Some(started.elapsed().as_millis() as u64);
    match sent {
      Ok(response) => {
        message.response = Some(response);
        message.marker = Marker::Completed;
      }
      Err(e) => {
        let kind = e.upstream_kind().unwrap_or(UpstreamFailure::Protocol);
        message.response = Some(HttpResponse::upstream_error(kind, &e.to_string()));
        message.marker = Marker::UpstreamError(kind);
      }
    }
    tracing::debug!(
      original = %original.id,
      replay = %message.id,
      status = ?message.status(),
      "message replayed"
    );
    self.storage.append_message(message.clone()).await?;
    if let Some(scanner) = &self.scanner {
      scanner.observe(&message).await;
    }
    self.events.publish(Event::NewMessage(message.summary()));
    Ok(message)
  }
}
