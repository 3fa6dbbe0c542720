//! engine error
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `viperscan::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an upstream exchange failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamFailure {
  /// name resolution failed
  Dns,
  /// TCP connection refused
  Refused,
  /// connect or read timed out
  Timeout,
  /// TLS negotiation with the target failed
  Tls,
  /// the target answered with something that is not HTTP
  Protocol,
  /// any other socket error
  Io,
}

impl UpstreamFailure {
  /// Map a socket error onto the failure taxonomy.
  pub fn from_io(err: &std::io::Error) -> Self {
    match err.kind() {
      ErrorKind::ConnectionRefused => UpstreamFailure::Refused,
      ErrorKind::TimedOut | ErrorKind::WouldBlock => UpstreamFailure::Timeout,
      ErrorKind::InvalidData => UpstreamFailure::Tls,
      _ => UpstreamFailure::Io,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      UpstreamFailure::Dns => "dns",
      UpstreamFailure::Refused => "refused",
      UpstreamFailure::Timeout => "timeout",
      UpstreamFailure::Tls => "tls",
      UpstreamFailure::Protocol => "protocol",
      UpstreamFailure::Io => "io",
    }
  }
}

impl fmt::Display for UpstreamFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Why a message could not be parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseFailure {
  /// the bytes do not form a valid message
  Malformed,
  /// the head or body is larger than the configured limit
  TooLarge,
}

/// The Errors that may occur inside the proxy, scanner, repeater and fuzzer.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Malformed wire data on a client connection
  #[error("protocol error: {0}")]
  Protocol(String),
  /// The target could not be reached or answered garbage
  #[error("upstream {kind} error: {message}")]
  Upstream {
    kind: UpstreamFailure,
    message: String,
  },
  /// Certificate issuance or loading failed
  #[error("certificate error: {0}")]
  Ca(String),
  /// Oversized or malformed head/body
  #[error("parse error: {message}")]
  Parse { kind: ParseFailure, message: String },
  /// A single scan check failed
  #[error("scan check error: {0}")]
  ScanCheck(String),
  /// Unknown message, session or job id
  #[error("not found: {0}")]
  NotFound(String),
  /// Operation not allowed in the current state
  #[error("invalid state: {0}")]
  InvalidState(String),
  /// Caller supplied an unusable argument
  #[error("invalid input: {0}")]
  Invalid(String),
  /// Configuration could not be loaded
  #[error("config error: {0}")]
  Config(String),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(#[from] http::Error),
  /// serde_json::Error
  #[error(transparent)]
  Json(#[from] serde_json::Error),
}

impl Error {
  /// Create a protocol error and log it
  pub fn protocol(msg: impl Into<String>) -> Self {
    let error = Error::Protocol(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create an upstream error and log it
  pub fn upstream(kind: UpstreamFailure, msg: impl Into<String>) -> Self {
    let error = Error::Upstream {
      kind,
      message: msg.into(),
    };
    tracing::warn!("{}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn ca(msg: impl Into<String>) -> Self {
    let error = Error::Ca(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a malformed-message error and log it
  pub fn malformed(msg: impl Into<String>) -> Self {
    let error = Error::Parse {
      kind: ParseFailure::Malformed,
      message: msg.into(),
    };
    tracing::warn!("{}", error);
    error
  }

  /// Create an oversized-message error and log it
  pub fn too_large(msg: impl Into<String>) -> Self {
    let error = Error::Parse {
      kind: ParseFailure::TooLarge,
      message: msg.into(),
    };
    tracing::warn!("{}", error);
    error
  }

  pub fn not_found(msg: impl Into<String>) -> Self {
    Error::NotFound(msg.into())
  }

  pub fn invalid_state(msg: impl Into<String>) -> Self {
    Error::InvalidState(msg.into())
  }

  pub fn invalid(msg: impl Into<String>) -> Self {
    Error::Invalid(msg.into())
  }

  /// Create a configuration error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// The upstream failure kind, when this error came from the target side.
  pub fn upstream_kind(&self) -> Option<UpstreamFailure> {
    match self {
      Error::Upstream { kind, .. } => Some(*kind),
      _ => None,
    }
  }

  /// Status code the proxy answers with when a client message is rejected.
  pub fn rejection_status(&self) -> http::StatusCode {
    match self {
      Error::Parse {
        kind: ParseFailure::TooLarge,
        ..
      } => http::StatusCode::PAYLOAD_TOO_LARGE,
      _ => http::StatusCode::BAD_REQUEST,
    }
  }
}
