//! HTTP/1.x wire codec.
//!
//! Decoding normalizes framing: chunked bodies are de-chunked and re-labelled
//! with `Content-Length`, header whitespace is trimmed and bare `LF` line
//! endings are accepted. Encoding always writes `Name: value` lines ending in
//! `CRLF`, so `encode(decode(x))` reproduces `x` byte-for-byte for input that
//! is already in that shape.
use crate::body::Body;
use crate::errors::{Error, Result};
use crate::headers::Headers;
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Size limits applied while decoding.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
  /// Start line plus header section, in bytes.
  pub max_header_size: usize,
  pub max_body_size: usize,
}

impl Default for Limits {
  fn default() -> Self {
    Self {
      max_header_size: 64 * 1024,
      max_body_size: 10 * 1024 * 1024,
    }
  }
}

/// Start line and raw header lines of a message, line endings removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawHead {
  pub start_line: String,
  pub header_lines: Vec<Vec<u8>>,
}

fn trim_line_ending(line: &mut Vec<u8>) {
  if line.last() == Some(&b'\n') {
    line.pop();
  }
  if line.last() == Some(&b'\r') {
    line.pop();
  }
}

/// Read a start line and header section.
///
/// Returns `Ok(None)` when the peer closed the stream before sending anything.
pub async fn read_head<R>(reader: &mut R, max_header_size: usize) -> Result<Option<RawHead>>
where
  R: AsyncBufRead + Unpin,
{
  let mut total = 0usize;
  let mut start_line: Option<String> = None;
  let mut header_lines = Vec::new();
  loop {
    let mut line = Vec::new();
    let remaining = (max_header_size + 1).saturating_sub(total) as u64;
    let n = (&mut *reader)
      .take(remaining)
      .read_until(b'\n', &mut line)
      .await?;
    if n == 0 {
      if start_line.is_none() {
        return Ok(None);
      }
      return Err(Error::malformed("unterminated header section"));
    }
    total += n;
    if line.last() != Some(&b'\n') {
      if total > max_header_size {
        return Err(Error::too_large(format!(
          "header section exceeds {} bytes",
          max_header_size
        )));
      }
      return Err(Error::malformed("unterminated header line"));
    }
    trim_line_ending(&mut line);
    match start_line {
      // stray CRLF between pipelined messages
      None if line.is_empty() => continue,
      None => start_line = Some(String::from_utf8_lossy(&line).into_owned()),
      Some(_) if line.is_empty() => break,
      Some(_) => header_lines.push(line),
    }
  }
  Ok(start_line.map(|start_line| RawHead {
    start_line,
    header_lines,
  }))
}

pub fn parse_version(v: &str) -> Option<Version> {
  match v {
    "HTTP/0.9" => Some(Version::HTTP_09),
    "HTTP/1.0" => Some(Version::HTTP_10),
    "HTTP/1.1" => Some(Version::HTTP_11),
    "HTTP/2.0" | "HTTP/2" => Some(Version::HTTP_2),
    _ => None,
  }
}

/// Split `METHOD target HTTP/x.y`.
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
  let parts: Vec<&str> = line.split_whitespace().collect();
  if parts.len() != 3 {
    return Err(Error::protocol(format!("invalid request line: {:?}", line)));
  }
  let method = Method::from_bytes(parts[0].as_bytes())
    .map_err(|_| Error::protocol(format!("invalid method: {:?}", parts[0])))?;
  let version = parse_version(parts[2])
    .ok_or_else(|| Error::protocol(format!("invalid http version: {:?}", parts[2])))?;
  Ok((method, parts[1].to_string(), version))
}

/// Split `HTTP/x.y code reason`.
pub fn parse_status_line(line: &str) -> Result<(Version, StatusCode, String)> {
  let mut parts = line.splitn(3, ' ');
  let version = parts
    .next()
    .and_then(parse_version)
    .ok_or_else(|| Error::protocol(format!("invalid status line: {:?}", line)))?;
  let status = parts
    .next()
    .and_then(|c| StatusCode::from_bytes(c.as_bytes()).ok())
    .ok_or_else(|| Error::protocol(format!("invalid status code: {:?}", line)))?;
  let reason = parts.next().unwrap_or_default().trim().to_string();
  Ok((version, status, reason))
}

/// Parse raw header lines, rejecting lines without a colon, empty or
/// whitespace-containing names and obsolete line folding.
pub fn parse_headers(lines: &[Vec<u8>]) -> Result<Headers> {
  let mut headers = Headers::new();
  for line in lines {
    if matches!(line.first(), Some(b' ') | Some(b'\t')) {
      return Err(Error::malformed("folded header line"));
    }
    let colon = line
      .iter()
      .position(|b| *b == b':')
      .ok_or_else(|| Error::malformed(format!("header without colon: {:?}", Bytes::copy_from_slice(line))))?;
    let name = &line[..colon];
    if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
      return Err(Error::malformed(format!(
        "invalid header name: {:?}",
        Bytes::copy_from_slice(name)
      )));
    }
    let value = String::from_utf8_lossy(&line[colon + 1..]);
    headers.append(
      String::from_utf8_lossy(name).into_owned(),
      value.trim_matches(|c| c == ' ' || c == '\t'),
    );
  }
  Ok(headers)
}

fn declared_length(headers: &Headers) -> Result<Option<usize>> {
  let values = headers.get_all("content-length");
  let mut length: Option<usize> = None;
  for v in values.iter().flat_map(|v| v.split(',')) {
    let parsed: usize = v
      .trim()
      .parse()
      .map_err(|_| Error::malformed(format!("invalid content-length: {:?}", v)))?;
    match length {
      Some(l) if l != parsed => return Err(Error::malformed("conflicting content-length values")),
      _ => length = Some(parsed),
    }
  }
  Ok(length)
}

async fn read_line_limited<R>(reader: &mut R, limit: u64) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
  if line.last() != Some(&b'\n') {
    return Err(Error::malformed("truncated chunked body"));
  }
  trim_line_ending(&mut line);
  Ok(line)
}

async fn read_chunked<R>(reader: &mut R, max_body_size: usize) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let line = read_line_limited(reader, 1024).await?;
    let line = String::from_utf8_lossy(&line);
    let size_text = line.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_text, 16)
      .map_err(|_| Error::malformed(format!("invalid chunk size: {:?}", size_text)))?;
    if size == 0 {
      // trailers are discarded
      loop {
        let trailer = read_line_limited(reader, 8 * 1024).await?;
        if trailer.is_empty() {
          break;
        }
      }
      return Ok(body);
    }
    if size > max_body_size.saturating_sub(body.len()) {
      return Err(Error::too_large(format!("body exceeds {} bytes", max_body_size)));
    }
    let start = body.len();
    body.resize(start + size, 0);
    reader
      .read_exact(&mut body[start..])
      .await
      .map_err(|_| Error::malformed("truncated chunked body"))?;
    read_line_limited(reader, 2).await?;
  }
}

/// Read a body framed by `headers`. Chunked bodies are normalized to
/// `Content-Length`; without any framing the body is empty unless
/// `until_eof` is set.
pub async fn read_body<R>(
  reader: &mut R,
  headers: &mut Headers,
  max_body_size: usize,
  until_eof: bool,
) -> Result<Body>
where
  R: AsyncBufRead + Unpin,
{
  if headers.is_chunked() {
    let body = read_chunked(reader, max_body_size).await?;
    headers.remove("transfer-encoding");
    headers.insert("Content-Length", body.len().to_string());
    return Ok(body.into());
  }
  if let Some(length) = declared_length(headers)? {
    if length > max_body_size {
      return Err(Error::too_large(format!(
        "content-length {} exceeds {} bytes",
        length, max_body_size
      )));
    }
    let mut body = vec![0; length];
    reader
      .read_exact(&mut body)
      .await
      .map_err(|_| Error::malformed("body shorter than content-length"))?;
    return Ok(body.into());
  }
  if !until_eof {
    return Ok(Body::default());
  }
  let mut body = Vec::new();
  (&mut *reader)
    .take(max_body_size as u64 + 1)
    .read_to_end(&mut body)
    .await?;
  if body.len() > max_body_size {
    return Err(Error::too_large(format!("body exceeds {} bytes", max_body_size)));
  }
  headers.insert("Content-Length", body.len().to_string());
  Ok(body.into())
}

/// Read one complete request. `Ok(None)` on a clean close.
pub async fn read_request<R>(reader: &mut R, limits: Limits) -> Result<Option<HttpRequest>>
where
  R: AsyncBufRead + Unpin,
{
  let head = match read_head(reader, limits.max_header_size).await? {
    Some(head) => head,
    None => return Ok(None),
  };
  let (method, target, version) = parse_request_line(&head.start_line)?;
  let mut headers = parse_headers(&head.header_lines)?;
  let body = read_body(reader, &mut headers, limits.max_body_size, false).await?;
  Ok(Some(HttpRequest {
    method,
    target,
    version,
    headers,
    body,
  }))
}

fn has_no_body(method: &Method, status: StatusCode) -> bool {
  method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
}

/// Read one complete response to a `method` request, skipping interim 1xx responses.
pub async fn read_response<R>(reader: &mut R, method: &Method, limits: Limits) -> Result<HttpResponse>
where
  R: AsyncBufRead + Unpin,
{
  loop {
    let head = read_head(reader, limits.max_header_size)
      .await?
      .ok_or_else(|| Error::protocol("connection closed before a response was received"))?;
    let (version, status, reason) = parse_status_line(&head.start_line)?;
    let mut headers = parse_headers(&head.header_lines)?;
    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
      continue;
    }
    let body = if has_no_body(method, status) {
      Body::default()
    } else {
      read_body(reader, &mut headers, limits.max_body_size, true).await?
    };
    return Ok(HttpResponse {
      version,
      status,
      reason,
      headers,
      body,
    });
  }
}

/// Decode a request held in memory.
pub async fn decode_request(mut raw: &[u8]) -> Result<HttpRequest> {
  read_request(&mut raw, Limits::default())
    .await?
    .ok_or_else(|| Error::malformed("empty request"))
}

/// Decode a response held in memory.
pub async fn decode_response(mut raw: &[u8], method: &Method) -> Result<HttpResponse> {
  read_response(&mut raw, method, Limits::default()).await
}

fn encode_headers(out: &mut Vec<u8>, headers: &Headers) {
  for (k, v) in headers.iter() {
    out.extend(k.as_bytes());
    out.extend(COLON_SPACE);
    out.extend(v.as_bytes());
    out.extend(CR_LF);
  }
  out.extend(CR_LF);
}

pub fn encode_request(request: &HttpRequest) -> Bytes {
  let mut raw = Vec::with_capacity(256 + request.body.len());
  raw.extend(request.method.as_str().as_bytes());
  raw.extend(SPACE);
  raw.extend(request.target.as_bytes());
  raw.extend(SPACE);
  raw.extend(format!("{:?}", request.version).as_bytes());
  raw.extend(CR_LF);
  encode_headers(&mut raw, &request.headers);
  raw.extend(request.body.as_ref());
  Bytes::from(raw)
}

pub fn encode_response(response: &HttpResponse) -> Bytes {
  let mut raw = Vec::with_capacity(256 + response.body.len());
  raw.extend(format!("{:?}", response.version).as_bytes());
  raw.extend(SPACE);
  raw.extend(response.status.as_str().as_bytes());
  if !response.reason.is_empty() {
    raw.extend(SPACE);
    raw.extend(response.reason.as_bytes());
  }
  raw.extend(CR_LF);
  encode_headers(&mut raw, &response.headers);
  raw.extend(response.body.as_ref());
  Bytes::from(raw)
}
