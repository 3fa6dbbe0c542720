use crate::body::Body;
use crate::errors::{Result, UpstreamFailure};
use crate::headers::Headers;
use bytes::Bytes;
#[cfg(feature = "gzip")]
use flate2::read::MultiGzDecoder;
use http::{StatusCode, Version};
use serde::{Deserialize, Serialize};
#[cfg(feature = "gzip")]
use std::io::Read;

/// Header carried by responses the proxy synthesizes when the target fails.
pub const ERROR_HEADER: &str = "x-viperscan-error";

/// A response as it travels through the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
  #[serde(with = "http_serde::version")]
  pub version: Version,
  #[serde(with = "http_serde::status_code")]
  pub status: StatusCode,
  /// Reason phrase exactly as received.
  pub reason: String,
  pub headers: Headers,
  pub body: Body,
}

impl Default for HttpResponse {
  fn default() -> Self {
    HttpResponse::new(StatusCode::OK)
  }
}

impl HttpResponse {
  /// An empty HTTP/1.1 response with the canonical reason phrase.
  pub fn new(status: StatusCode) -> Self {
    Self {
      version: Version::HTTP_11,
      status,
      reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
      headers: Headers::new(),
      body: Body::default(),
    }
  }

  /// A complete response with a body and its framing headers.
  pub fn with_body(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Self {
    let mut response = HttpResponse::new(status);
    response.headers.insert("Content-Type", content_type);
    response.body = body.into();
    response
      .headers
      .insert("Content-Length", response.body.len().to_string());
    response
  }

  /// The stand-in response recorded when the target could not be reached.
  pub fn upstream_error(kind: UpstreamFailure, detail: &str) -> Self {
    let mut response = HttpResponse::with_body(
      StatusCode::BAD_GATEWAY,
      "text/plain; charset=utf-8",
      format!("viperscan: upstream {} error: {}\n", kind, detail),
    );
    response.headers.insert(ERROR_HEADER, kind.as_str());
    response.headers.insert("Connection", "close");
    response
  }

  pub fn header(mut self, name: &str, value: &str) -> Self {
    self.headers.append(name, value);
    self
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get("content-type")
  }

  /// Whether this response was synthesized by the proxy.
  pub fn is_synthetic(&self) -> bool {
    self.headers.contains(ERROR_HEADER)
  }

  /// Make `Content-Length` agree with the body after an edit.
  pub fn sync_content_length(&mut self) {
    self.headers.remove("transfer-encoding");
    self
      .headers
      .insert("Content-Length", self.body.len().to_string());
  }

  /// Body with any gzip content-coding removed, for analysis.
  pub fn decoded_body(&self) -> Result<Bytes> {
    #[cfg(feature = "gzip")]
    if let Some(ce) = self.headers.get("content-encoding") {
      if ce.trim().eq_ignore_ascii_case("gzip") && !self.body.is_empty() {
        let mut plain = Vec::new();
        let mut d = MultiGzDecoder::new(&self.body[..]);
        d.read_to_end(&mut plain)
          .map_err(|e| crate::errors::Error::malformed(format!("gzip body: {}", e)))?;
        return Ok(Bytes::from(plain));
      }
    }
    Ok(self.body.bytes())
  }

  /// Lossy text of the decoded body; undecodable bodies read as empty.
  pub fn text(&self) -> String {
    match self.decoded_body() {
      Ok(b) => String::from_utf8_lossy(&b).to_string(),
      Err(_) => String::new(),
    }
  }

  pub fn to_raw(&self) -> Bytes {
    crate::codec::encode_response(self)
  }
}
