use crate::body::Body;
use crate::errors::{Error, Result};
use crate::headers::Headers;
use bytes::Bytes;
use http::{Method, Version};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters escaped inside a query name or value.
pub(crate) const QUERY_COMPONENT: &AsciiSet = &CONTROLS
  .add(b' ')
  .add(b'"')
  .add(b'#')
  .add(b'%')
  .add(b'&')
  .add(b'+')
  .add(b'<')
  .add(b'=')
  .add(b'>')
  .add(b'`')
  .add(b'\'');

/// URL scheme understood by the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
  Http,
  Https,
}

impl Scheme {
  pub fn default_port(&self) -> u16 {
    match self {
      Scheme::Http => 80,
      Scheme::Https => 443,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Scheme::Http => "http",
      Scheme::Https => "https",
    }
  }
}

/// Target of a message: scheme, host, port, path and raw query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Url {
  pub scheme: Scheme,
  pub host: String,
  pub port: u16,
  pub path: String,
  pub query: Option<String>,
}

impl Url {
  /// Parse an absolute `http://` or `https://` URL.
  pub fn parse(input: &str) -> Result<Url> {
    let uri: http::Uri = input
      .trim()
      .parse()
      .map_err(|e| Error::invalid(format!("invalid url {:?}: {}", input, e)))?;
    let scheme = match uri.scheme_str() {
      Some(s) if s.eq_ignore_ascii_case("http") => Scheme::Http,
      Some(s) if s.eq_ignore_ascii_case("https") => Scheme::Https,
      _ => return Err(Error::invalid(format!("unsupported scheme in {:?}", input))),
    };
    let host = uri
      .host()
      .filter(|h| !h.is_empty())
      .ok_or_else(|| Error::invalid(format!("missing host in {:?}", input)))?
      .to_ascii_lowercase();
    let port = uri.port_u16().unwrap_or(scheme.default_port());
    let path = match uri.path() {
      "" => "/".to_string(),
      p => p.to_string(),
    };
    Ok(Url {
      scheme,
      host,
      port,
      path,
      query: uri.query().map(|q| q.to_string()),
    })
  }

  /// Build a URL from an origin-form request target received for `authority`.
  pub fn from_origin_form(scheme: Scheme, host: &str, port: u16, target: &str) -> Result<Url> {
    if !target.starts_with('/') {
      return Err(Error::invalid(format!("not an origin-form target: {}", target)));
    }
    let (path, query) = match target.split_once('?') {
      Some((p, q)) => (p.to_string(), Some(q.to_string())),
      None => (target.to_string(), None),
    };
    Ok(Url {
      scheme,
      host: host.to_ascii_lowercase(),
      port,
      path,
      query,
    })
  }

  /// `host` or `host:port` when the port is not the scheme default.
  pub fn authority(&self) -> String {
    if self.port == self.scheme.default_port() {
      self.host.clone()
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }

  /// Path plus query, as sent on the request line.
  pub fn origin_form(&self) -> String {
    match &self.query {
      Some(q) => format!("{}?{}", self.path, q),
      None => self.path.clone(),
    }
  }

  /// Decoded query parameters in order.
  pub fn query_pairs(&self) -> Vec<(String, String)> {
    let query = match &self.query {
      Some(q) if !q.is_empty() => q,
      _ => return Vec::new(),
    };
    query
      .split('&')
      .filter(|p| !p.is_empty())
      .map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (decode_component(k), decode_component(v))
      })
      .collect()
  }

  /// Copy with the first parameter named `name` set to `value`, appending it when absent.
  pub fn with_query_param(&self, name: &str, value: &str) -> Url {
    let encoded = format!(
      "{}={}",
      utf8_percent_encode(name, QUERY_COMPONENT),
      utf8_percent_encode(value, QUERY_COMPONENT)
    );
    let mut replaced = false;
    let mut parts: Vec<String> = Vec::new();
    if let Some(q) = &self.query {
      for pair in q.split('&').filter(|p| !p.is_empty()) {
        let key = pair.split_once('=').map(|(k, _)| k).unwrap_or(pair);
        if !replaced && decode_component(key) == name {
          parts.push(encoded.clone());
          replaced = true;
        } else {
          parts.push(pair.to_string());
        }
      }
    }
    if !replaced {
      parts.push(encoded);
    }
    let mut url = self.clone();
    url.query = Some(parts.join("&"));
    url
  }

  /// Copy with a new path and no query.
  pub fn with_path(&self, path: &str) -> Url {
    let mut url = self.clone();
    url.path = if path.starts_with('/') {
      path.to_string()
    } else {
      format!("/{}", path)
    };
    url.query = None;
    url
  }

  /// Whether this URL lies under `scope`: same origin and a path prefix match.
  pub fn in_scope(&self, scope: &Url) -> bool {
    self.scheme == scope.scheme
      && self.port == scope.port
      && self.host.eq_ignore_ascii_case(&scope.host)
      && self.path.starts_with(scope.path.trim_end_matches('/'))
  }

  /// Lower-cased extension of the last path segment.
  pub fn extension(&self) -> Option<String> {
    let segment = self.path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() {
      None
    } else {
      Some(ext.to_ascii_lowercase())
    }
  }
}

impl fmt::Display for Url {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}://{}{}",
      self.scheme.as_str(),
      self.authority(),
      self.origin_form()
    )
  }
}

impl std::str::FromStr for Url {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    Url::parse(s)
  }
}

fn decode_component(s: &str) -> String {
  percent_decode_str(s).decode_utf8_lossy().to_string()
}

/// A request as it travels through the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
  #[serde(with = "http_serde::method")]
  pub method: Method,
  /// Request target exactly as received (origin-form or absolute-form).
  pub target: String,
  #[serde(with = "http_serde::version")]
  pub version: Version,
  pub headers: Headers,
  pub body: Body,
}

impl Default for HttpRequest {
  fn default() -> Self {
    Self {
      method: Method::GET,
      target: "/".to_string(),
      version: Version::HTTP_11,
      headers: Headers::new(),
      body: Body::default(),
    }
  }
}

impl HttpRequest {
  /// An HTTP/1.1 request for `url` with origin-form target and a `Host` header.
  pub fn new(method: Method, url: &Url) -> Self {
    let mut headers = Headers::new();
    headers.insert("Host", url.authority());
    Self {
      method,
      target: url.origin_form(),
      version: Version::HTTP_11,
      headers,
      body: Body::default(),
    }
  }

  pub fn header(mut self, name: &str, value: &str) -> Self {
    self.headers.append(name, value);
    self
  }

  pub fn body(mut self, body: impl Into<Body>) -> Self {
    self.body = body.into();
    self.sync_content_length();
    self
  }

  /// Point the request at `url`: origin-form target and matching `Host`.
  pub fn retarget(&mut self, url: &Url) {
    self.target = url.origin_form();
    self.headers.insert("Host", url.authority());
  }

  /// Make `Content-Length` agree with the body.
  pub fn sync_content_length(&mut self) {
    if !self.body.is_empty() || self.headers.contains("content-length") {
      self.headers.remove("transfer-encoding");
      self
        .headers
        .insert("Content-Length", self.body.len().to_string());
    }
  }

  /// Whether the client asked to keep the connection open after this exchange.
  pub fn wants_keep_alive(&self) -> bool {
    if self.headers.has_connection_token("close") {
      return false;
    }
    self.version == Version::HTTP_11 || self.headers.has_connection_token("keep-alive")
  }

  pub fn to_raw(&self) -> Bytes {
    crate::codec::encode_request(self)
  }
}
