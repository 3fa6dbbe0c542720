//! The captured request/response pair every component operates on.
use crate::errors::UpstreamFailure;
use crate::ids::MessageId;
use crate::request::{HttpRequest, Url};
use crate::response::HttpResponse;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// Who originated the exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
  Proxy,
  Repeater,
  Scanner,
}

/// How the exchange ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum Marker {
  /// Response received and relayed.
  Completed,
  /// Dropped by an intercept decision; never reached the target or the client.
  Dropped,
  /// The target failed; the stored response is synthetic.
  UpstreamError(UpstreamFailure),
  /// The proxy refused the client message.
  Rejected(String),
  /// The client went away before the exchange finished.
  ClientClosed,
}

impl Marker {
  pub fn as_str(&self) -> &'static str {
    match self {
      Marker::Completed => "completed",
      Marker::Dropped => "dropped",
      Marker::UpstreamError(_) => "upstream-error",
      Marker::Rejected(_) => "rejected",
      Marker::ClientClosed => "client-closed",
    }
  }
}

/// A captured exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
  pub id: MessageId,
  /// Client connection the message arrived on; zero for internally originated traffic.
  pub connection_id: u64,
  /// Position within its connection.
  pub sequence: u64,
  pub url: Url,
  pub request: HttpRequest,
  pub response: Option<HttpResponse>,
  pub timestamp: u64,
  pub latency_ms: Option<u64>,
  pub intercepted: bool,
  pub edited: bool,
  pub marker: Marker,
  pub source: Source,
}

impl Message {
  pub fn new(url: Url, request: HttpRequest, source: Source) -> Self {
    Self {
      id: MessageId::new(),
      connection_id: 0,
      sequence: 0,
      url,
      request,
      response: None,
      timestamp: now_millis(),
      latency_ms: None,
      intercepted: false,
      edited: false,
      marker: Marker::Completed,
      source,
    }
  }

  pub fn on_connection(mut self, connection_id: u64, sequence: u64) -> Self {
    self.connection_id = connection_id;
    self.sequence = sequence;
    self
  }

  pub fn method(&self) -> &str {
    self.request.method.as_str()
  }

  /// Status code, absent until a response arrived.
  pub fn status(&self) -> Option<u16> {
    self.response.as_ref().map(|r| r.status.as_u16())
  }

  pub fn summary(&self) -> MessageSummary {
    MessageSummary {
      id: self.id,
      connection_id: self.connection_id,
      sequence: self.sequence,
      method: self.method().to_string(),
      url: self.url.to_string(),
      status: self.status(),
      length: self.response.as_ref().map(|r| r.body.len()),
      latency_ms: self.latency_ms,
      timestamp: self.timestamp,
      intercepted: self.intercepted,
      edited: self.edited,
      marker: self.marker.clone(),
      source: self.source,
    }
  }
}

/// Compact view published on the event stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
  pub id: MessageId,
  pub connection_id: u64,
  pub sequence: u64,
  pub method: String,
  pub url: String,
  pub status: Option<u16>,
  pub length: Option<usize>,
  pub latency_ms: Option<u64>,
  pub timestamp: u64,
  pub intercepted: bool,
  pub edited: bool,
  pub marker: Marker,
  pub source: Source,
}

/// History filter. Empty fields match everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageFilter {
  /// Case-insensitive substring of the URL or method.
  pub search: Option<String>,
  pub method: Option<String>,
  pub host: Option<String>,
  /// Exact status code.
  pub status: Option<u16>,
  /// Status class, e.g. `4` for 4xx.
  pub status_class: Option<u16>,
  pub source: Option<Source>,
  pub intercepted_only: bool,
}

impl MessageFilter {
  pub fn search(mut self, needle: impl Into<String>) -> Self {
    self.search = Some(needle.into());
    self
  }

  pub fn method(mut self, method: impl Into<String>) -> Self {
    self.method = Some(method.into());
    self
  }

  pub fn host(mut self, host: impl Into<String>) -> Self {
    self.host = Some(host.into());
    self
  }

  pub fn source(mut self, source: Source) -> Self {
    self.source = Some(source);
    self
  }

  pub fn matches(&self, message: &Message) -> bool {
    if let Some(needle) = &self.search {
      let needle = needle.to_ascii_lowercase();
      let url = message.url.to_string().to_ascii_lowercase();
      if !url.contains(&needle) && !message.method().to_ascii_lowercase().contains(&needle) {
        return false;
      }
    }
    if let Some(m) = &self.method {
      if !message.method().eq_ignore_ascii_case(m) {
        return false;
      }
    }
    if let Some(h) = &self.host {
      if !message.url.host.eq_ignore_ascii_case(h) {
        return false;
      }
    }
    if let Some(s) = self.status {
      if message.status() != Some(s) {
        return false;
      }
    }
    if let Some(class) = self.status_class {
      if message.status().map(|s| s / 100) != Some(class) {
        return false;
      }
    }
    if let Some(source) = self.source {
      if message.source != source {
        return false;
      }
    }
    !self.intercepted_only || message.intercepted
  }
}
