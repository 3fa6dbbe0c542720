use crate::codec::Limits;
use crate::errors::{Error, Result};
use crate::intercept::{DefaultDecision, InterceptFilter, InterceptSettings};
use crate::scan::ScanSettings;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the proxy and everything behind it.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ViperConfig {
  /// Address the proxy listens on.
  pub listen_addr: SocketAddr,
  /// Directory holding the root certificate and key.
  pub ca_storage_path: PathBuf,
  /// Decrypt `CONNECT` tunnels; when off they are relayed byte for byte.
  pub enable_https_interception: bool,
  pub max_header_size: usize,
  pub max_body_size: usize,
  pub connect_timeout_secs: u64,
  pub read_timeout_secs: u64,
  pub intercept_timeout_ms: u64,
  pub intercept_default: DefaultDecision,
  pub intercept_responses: bool,
  pub intercept_filter: InterceptFilter,
  pub scan_concurrency: usize,
  pub probe_timeout_ms: u64,
  /// Per-subscriber event queue length.
  pub event_capacity: usize,
  /// Host name served by the control surface (`http://viperscan/ca.pem`).
  pub control_host: String,
  pub verify_upstream_certs: bool,
  /// PEM bundles trusted in addition to the built-in roots.
  pub upstream_root_pems: Vec<PathBuf>,
  /// `host` or `host:port` resolved to a fixed address before DNS.
  pub host_overrides: HashMap<String, SocketAddr>,
}

impl Default for ViperConfig {
  fn default() -> Self {
    Self {
      listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
      ca_storage_path: PathBuf::from(".viperscan"),
      enable_https_interception: true,
      max_header_size: Limits::default().max_header_size,
      max_body_size: Limits::default().max_body_size,
      connect_timeout_secs: 10,
      read_timeout_secs: 30,
      intercept_timeout_ms: 60_000,
      intercept_default: DefaultDecision::Forward,
      intercept_responses: false,
      intercept_filter: InterceptFilter::default(),
      scan_concurrency: 8,
      probe_timeout_ms: 10_000,
      event_capacity: 1024,
      control_host: "viperscan".to_string(),
      verify_upstream_certs: false,
      upstream_root_pems: Vec::new(),
      host_overrides: HashMap::new(),
    }
  }
}

impl ViperConfig {
  /// Load from a JSON file; missing fields take their defaults.
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&text).map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
  }

  pub fn limits(&self) -> Limits {
    Limits {
      max_header_size: self.max_header_size,
      max_body_size: self.max_body_size,
    }
  }

  pub fn intercept_settings(&self) -> InterceptSettings {
    InterceptSettings {
      timeout: Duration::from_millis(self.intercept_timeout_ms),
      default_decision: self.intercept_default,
      intercept_responses: self.intercept_responses,
      filter: self.intercept_filter.clone(),
    }
  }

  pub fn scan_settings(&self) -> ScanSettings {
    ScanSettings {
      concurrency: self.scan_concurrency,
      probe_timeout: Duration::from_millis(self.probe_timeout_ms),
    }
  }

  fn timeout(secs: u64) -> Option<Duration> {
    if secs == 0 {
      None
    } else {
      Some(Duration::from_secs(secs))
    }
  }

  pub fn connect_timeout(&self) -> Option<Duration> {
    Self::timeout(self.connect_timeout_secs)
  }

  /// Whole-exchange upstream timeout; zero disables it.
  pub fn read_timeout(&self) -> Option<Duration> {
    Self::timeout(self.read_timeout_secs)
  }
}
