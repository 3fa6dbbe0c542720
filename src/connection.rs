//! Per-connection request loop shared by plain and decrypted streams.
use crate::codec::{self, Limits};
use crate::control::{self, ControlReply};
use crate::errors::{Error, UpstreamFailure};
use crate::events::Event;
use crate::headers::Headers;
use crate::intercept::{InterceptDecision, InterceptPhase};
use crate::message::{Marker, Message, Source};
use crate::request::{HttpRequest, Scheme, Url};
use crate::response::HttpResponse;
use crate::server::ProxyState;
use http::Method;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Where the stream being served came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
  /// A client connected to the listener directly.
  Plain,
  /// The decrypted inside of a `CONNECT` tunnel to `host:port`.
  Tunnel { host: String, port: u16 },
}

/// Why the request loop ended.
pub enum Outcome<S> {
  Closed,
  /// The client asked for a tunnel. The reader still holds any bytes sent after the request.
  Connect {
    request: HttpRequest,
    reader: BufReader<S>,
    sequence: u64,
  },
}

enum Incoming {
  Request(HttpRequest),
  Closed,
  Rejected {
    partial: Option<HttpRequest>,
    error: Error,
  },
}

/// Read the next request, keeping whatever was parsed when it is rejected.
async fn next_request<R>(reader: &mut R, limits: Limits) -> Incoming
where
  R: AsyncBufRead + Unpin,
{
  let head = match codec::read_head(reader, limits.max_header_size).await {
    Ok(Some(head)) => head,
    Ok(None) => return Incoming::Closed,
    Err(error) => return Incoming::Rejected { partial: None, error },
  };
  let (method, target, version) = match codec::parse_request_line(&head.start_line) {
    Ok(line) => line,
    Err(error) => return Incoming::Rejected { partial: None, error },
  };
  let mut request = HttpRequest {
    method,
    target,
    version,
    headers: Headers::new(),
    body: Default::default(),
  };
  match codec::parse_headers(&head.header_lines) {
    Ok(headers) => request.headers = headers,
    Err(error) => {
      return Incoming::Rejected {
        partial: Some(request),
        error,
      }
    }
  }
  match codec::read_body(reader, &mut request.headers, limits.max_body_size, false).await {
    Ok(body) => {
      request.body = body;
      Incoming::Request(request)
    }
    Err(error) => Incoming::Rejected {
      partial: Some(request),
      error,
    },
  }
}

/// Resolves once the client has closed its side. Pipelined bytes are left in
/// the buffer and never resolve it.
async fn until_closed<R>(reader: &mut R)
where
  R: AsyncBufRead + Unpin,
{
  match reader.fill_buf().await {
    Ok(buf) if buf.is_empty() => {}
    Ok(_) => std::future::pending::<()>().await,
    Err(_) => {}
  }
}

/// Where a request is going.
enum Route {
  Control(String),
  Upstream(Url),
}

fn route(state: &ProxyState, origin: &Origin, request: &HttpRequest) -> crate::errors::Result<Route> {
  let target = request.target.as_str();
  let url = if target.starts_with('/') {
    match origin {
      // origin-form on the listener addresses the proxy itself
      Origin::Plain => return Ok(Route::Control(path_of(target))),
      Origin::Tunnel { host, port } => Url::from_origin_form(Scheme::Https, host, *port, target)?,
    }
  } else {
    Url::parse(target).map_err(|e| Error::protocol(format!("bad request target: {}", e)))?
  };
  if state.control.is_control_host(&url.host) {
    return Ok(Route::Control(url.path));
  }
  Ok(Route::Upstream(url))
}

fn path_of(target: &str) -> String {
  target.split('?').next().unwrap_or("/").to_string()
}

/// Serve requests on `stream` until it closes or asks for a tunnel.
pub async fn serve<S>(
  state: &ProxyState,
  stream: S,
  origin: Origin,
  connection_id: u64,
) -> crate::errors::Result<Outcome<S>>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let mut reader = BufReader::new(stream);
  let mut sequence = 0u64;
  loop {
    let request = match next_request(&mut reader, state.limits).await {
      Incoming::Request(request) => request,
      Incoming::Closed => return Ok(Outcome::Closed),
      Incoming::Rejected { partial, error } => {
        sequence += 1;
        reject(state, &mut reader, &origin, partial, error, connection_id, sequence).await;
        return Ok(Outcome::Closed);
      }
    };
    sequence += 1;

    if request.method == Method::CONNECT {
      if origin != Origin::Plain {
        let error = Error::protocol("CONNECT inside a tunnel");
        reject(state, &mut reader, &origin, Some(request), error, connection_id, sequence).await;
        return Ok(Outcome::Closed);
      }
      return Ok(Outcome::Connect {
        request,
        reader,
        sequence,
      });
    }

    let url = match route(state, &origin, &request) {
      Ok(Route::Upstream(url)) => url,
      Ok(Route::Control(path)) => {
        match state.control.handle(&request, &path) {
          ControlReply::Response(mut response) => {
            let keep_alive = request.wants_keep_alive();
            response
              .headers
              .insert("Connection", if keep_alive { "keep-alive" } else { "close" });
            if request.method == Method::HEAD {
              response.body = Default::default();
            }
            reader.write_all(&response.to_raw()).await?;
            reader.flush().await?;
            if !keep_alive {
              return Ok(Outcome::Closed);
            }
            continue;
          }
          ControlReply::EventStream(subscription) => {
            tracing::debug!(connection = connection_id, "event stream opened");
            if let Err(e) = control::stream_events(&mut reader, subscription).await {
              tracing::debug!(connection = connection_id, error = %e, "event stream closed");
            }
            return Ok(Outcome::Closed);
          }
        }
      }
      Err(error) => {
        reject(state, &mut reader, &origin, Some(request), error, connection_id, sequence).await;
        return Ok(Outcome::Closed);
      }
    };

    let message = Message::new(url, request, Source::Proxy).on_connection(connection_id, sequence);
    if !exchange(state, &mut reader, message).await? {
      return Ok(Outcome::Closed);
    }
  }
}

/// Forward one message and answer the client. Returns whether the
/// connection stays open.
async fn exchange<S>(
  state: &ProxyState,
  reader: &mut BufReader<S>,
  mut message: Message,
) -> crate::errors::Result<bool>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let keep_alive = message.request.wants_keep_alive();
  let id = message.id;
  tracing::debug!(%id, connection = message.connection_id, method = %message.request.method, url = %message.url, "request");

  if state.intercept.should_hold(&message, InterceptPhase::Request) {
    message.intercepted = true;
    let decision = tokio::select! {
      decision = state.intercept.hold(message.clone(), InterceptPhase::Request) => decision,
      _ = until_closed(reader) => {
        message.marker = Marker::ClientClosed;
        state.record(&message).await;
        return Ok(false);
      }
    };
    match decision {
      InterceptDecision::Forward => {}
      InterceptDecision::ForwardEdited(edited) => {
        message.url = edited.url;
        message.request = edited.request;
        message.request.sync_content_length();
        message.edited = true;
      }
      InterceptDecision::Drop => {
        message.marker = Marker::Dropped;
        state.record(&message).await;
        return Ok(false);
      }
    }
  }

  let started = Instant::now();
  let sent = tokio::select! {
    sent = state.transport.send(&message.url, &message.request) => sent,
    _ = until_closed(reader) => {
      message.marker = Marker::ClientClosed;
      message.latency_ms = Some(started.elapsed().as_millis() as u64);
      state.record(&message).await;
      return Ok(false);
    }
  };
  message.latency_ms = Some(started.elapsed().as_millis() as u64);
  let response = match sent {
    Ok(response) => response,
    Err(e) => {
      let kind = e.upstream_kind().unwrap_or(UpstreamFailure::Protocol);
      message.marker = Marker::UpstreamError(kind);
      HttpResponse::upstream_error(kind, &e.to_string())
    }
  };
  let synthetic = response.is_synthetic();
  message.response = Some(response);

  if !synthetic && state.intercept.should_hold(&message, InterceptPhase::Response) {
    message.intercepted = true;
    let decision = tokio::select! {
      decision = state.intercept.hold(message.clone(), InterceptPhase::Response) => decision,
      _ = until_closed(reader) => {
        message.marker = Marker::ClientClosed;
        state.record(&message).await;
        return Ok(false);
      }
    };
    match decision {
      InterceptDecision::Forward => {}
      InterceptDecision::ForwardEdited(edited) => {
        if let Some(mut response) = edited.response {
          if message.request.method != Method::HEAD {
            response.sync_content_length();
          }
          message.response = Some(response);
          message.edited = true;
        }
      }
      InterceptDecision::Drop => {
        message.marker = Marker::Dropped;
        message.response = None;
        state.record(&message).await;
        return Ok(false);
      }
    }
  }

  state.record(&message).await;

  let mut reply = match &message.response {
    Some(r) => r.clone(),
    None => return Ok(false),
  };
  reply.headers.strip_hop_by_hop();
  reply
    .headers
    .insert("Connection", if keep_alive { "keep-alive" } else { "close" });
  if let Err(e) = reader.write_all(&reply.to_raw()).await {
    tracing::debug!(%id, error = %e, "client went away before the response was written");
    return Ok(false);
  }
  reader.flush().await?;
  Ok(keep_alive)
}

/// Answer a message the proxy refuses and record it when enough was parsed.
async fn reject<S>(
  state: &ProxyState,
  reader: &mut BufReader<S>,
  origin: &Origin,
  partial: Option<HttpRequest>,
  error: Error,
  connection_id: u64,
  sequence: u64,
) where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let status = error.rejection_status();
  let reply = HttpResponse::with_body(status, "text/plain; charset=utf-8", format!("{}\n", error))
    .header("Connection", "close");
  if let Err(e) = reader.write_all(&reply.to_raw()).await {
    tracing::debug!(connection = connection_id, error = %e, "rejection not delivered");
  }
  let _ = reader.flush().await;
  let request = match partial {
    Some(r) => r,
    None => {
      tracing::warn!(connection = connection_id, %error, "unparseable request dropped");
      return;
    }
  };
  let url = Url::parse(&request.target).or_else(|_| match origin {
    Origin::Tunnel { host, port } => Url::from_origin_form(Scheme::Https, host, *port, &path_of(&request.target)),
    Origin::Plain => Url::parse(&format!(
      "http://{}{}",
      request.headers.get("host").unwrap_or("unknown.invalid"),
      if request.target.starts_with('/') { path_of(&request.target) } else { "/".to_string() }
    )),
  });
  let url = match url {
    Ok(url) => url,
    Err(_) => {
      tracing::warn!(connection = connection_id, %error, "rejected request without a usable target");
      return;
    }
  };
  let mut message = Message::new(url, request, Source::Proxy).on_connection(connection_id, sequence);
  message.marker = Marker::Rejected(error.to_string());
  message.response = Some(reply);
  state.record(&message).await;
}

impl ProxyState {
  /// Hand a finished message to storage, passive checks and observers.
  pub(crate) async fn record(&self, message: &Message) {
    tracing::debug!(
      id = %message.id,
      connection = message.connection_id,
      sequence = message.sequence,
      status = ?message.status(),
      marker = message.marker.as_str(),
      "message recorded"
    );
    if let Err(e) = self.storage.append_message(message.clone()).await {
      tracing::warn!(id = %message.id, error = %e, "failed to store message");
    }
    self.scanner.observe(message).await;
    self.events.publish(Event::NewMessage(message.summary()));
  }
}
