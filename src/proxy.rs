//! The `ViperProxy` facade: one handle over the proxy, intercept queue,
//! scanner, repeater, fuzzer and event stream.
use crate::ca::CertificateManager;
use crate::client::{Transport, UpstreamClient};
use crate::config::ViperConfig;
use crate::connector::Connector;
use crate::control::ControlSurface;
use crate::errors::Result;
use crate::events::{EventBus, Subscription};
use crate::fuzz::{FuzzJob, FuzzResult, FuzzSpec, Fuzzer};
use crate::ids::{JobId, MessageId, SessionId};
use crate::intercept::{DecideOutcome, InterceptDecision, InterceptQueue, PendingIntercept};
use crate::message::{Message, MessageFilter};
use crate::record::{self, CommandRecord};
use crate::repeater::{MessageEdits, Repeater};
use crate::scan::{Finding, ScanEngine, ScanProfile, ScanSession};
use crate::server::{ProxyServer, ProxyState};
use crate::storage::{MemoryStorage, Storage};
use crate::tls;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

pub struct ViperProxy {
  config: ViperConfig,
  state: Arc<ProxyState>,
  repeater: Repeater,
  fuzzer: Arc<Fuzzer>,
}

impl ViperProxy {
  /// Build every component over in-memory storage.
  ///
  /// Fails when the root certificate can neither be loaded nor generated.
  pub async fn new(config: ViperConfig) -> Result<Self> {
    Self::with_storage(config, Arc::new(MemoryStorage::new())).await
  }

  pub async fn with_storage(config: ViperConfig, storage: Arc<dyn Storage>) -> Result<Self> {
    let certs = Arc::new(CertificateManager::new(&config.ca_storage_path).await?);

    let mut roots = Vec::new();
    for path in &config.upstream_root_pems {
      roots.extend(tls::load_pem_certificates(path)?);
    }
    let mut builder = Connector::builder()
      .connect_timeout(config.connect_timeout())
      .certs_verification(config.verify_upstream_certs)
      .certificate(roots);
    for (host, addr) in &config.host_overrides {
      builder = builder.host_override(host.clone(), *addr);
    }
    let connector = builder.build()?;
    let transport: Arc<dyn Transport> = Arc::new(UpstreamClient::new(
      connector.clone(),
      config.read_timeout(),
      config.limits(),
    ));

    let events = EventBus::new(config.event_capacity);
    let intercept = Arc::new(InterceptQueue::new(
      config.intercept_settings(),
      events.clone(),
    ));
    let scanner = Arc::new(ScanEngine::new(
      transport.clone(),
      storage.clone(),
      events.clone(),
      config.scan_settings(),
    ));
    let repeater = Repeater::new(transport.clone(), storage.clone(), events.clone())
      .with_scanner(scanner.clone());
    let fuzzer = Arc::new(Fuzzer::new(transport.clone(), storage.clone(), events.clone()));
    let control = ControlSurface::new(config.control_host.clone(), certs.clone(), events.clone());
    let state = Arc::new(ProxyState::new(
      config.limits(),
      config.enable_https_interception,
      connector,
      transport,
      intercept,
      scanner,
      storage,
      events,
      control,
      certs,
    ));
    tracing::info!(ca = %state.certs.ca_cert_path().display(), "viperscan ready");
    Ok(Self {
      config,
      state,
      repeater,
      fuzzer,
    })
  }

  pub fn config(&self) -> &ViperConfig {
    &self.config
  }

  // proxy control

  /// Switch interception. Disabling it forwards every held message unmodified;
  /// returns how many were released.
  pub async fn set_intercept(&self, enabled: bool) -> usize {
    self.state.intercept.set_enabled(enabled)
  }

  pub async fn is_intercepting(&self) -> bool {
    self.state.intercept.is_enabled()
  }

  pub async fn pending_intercepts(&self) -> Vec<PendingIntercept> {
    self.state.intercept.pending()
  }

  pub async fn decide(&self, id: MessageId, decision: InterceptDecision) -> Result<DecideOutcome> {
    self.state.intercept.decide(id, decision)
  }

  pub async fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
    self.state.storage.messages(filter).await
  }

  pub async fn get_message(&self, id: MessageId) -> Result<Message> {
    self.state.storage.message(id).await
  }

  pub async fn delete_message(&self, id: MessageId) -> Result<()> {
    self.state.storage.remove_message(id).await
  }

  /// Filtered history as pretty JSON.
  pub async fn export_messages(&self, filter: &MessageFilter) -> Result<String> {
    record::export_json(&self.list_messages(filter).await?)
  }

  /// The message as a `curl` command line.
  pub async fn curl_command(&self, id: MessageId) -> Result<String> {
    Ok(CommandRecord::curl(&self.get_message(id).await?).command)
  }

  // scanning

  pub async fn start_scan(&self, target: &str, profile: ScanProfile) -> Result<SessionId> {
    self.state.scanner.start_scan(target, profile).await
  }

  pub async fn get_session(&self, id: SessionId) -> Result<ScanSession> {
    self.state.scanner.get_session(id).await
  }

  pub async fn list_sessions(&self) -> Result<Vec<ScanSession>> {
    self.state.scanner.list_sessions().await
  }

  /// Findings of one session, or every finding when `session` is `None`.
  pub async fn list_findings(&self, session: Option<SessionId>) -> Result<Vec<Finding>> {
    self.state.scanner.list_findings(session).await
  }

  pub async fn cancel_scan(&self, id: SessionId) -> Result<()> {
    self.state.scanner.cancel_scan(id).await
  }

  // repeater

  pub async fn replay(&self, id: MessageId, edits: &MessageEdits) -> Result<Message> {
    let original = self.get_message(id).await?;
    self.repeater.replay(&original, edits).await
  }

  // fuzzing

  pub async fn start_fuzz(&self, spec: FuzzSpec) -> Result<JobId> {
    self.fuzzer.start_fuzz(spec).await
  }

  pub async fn get_fuzz_results(&self, id: JobId) -> Result<Vec<FuzzResult>> {
    self.fuzzer.get_fuzz_results(id).await
  }

  pub async fn get_fuzz_job(&self, id: JobId) -> Result<FuzzJob> {
    self.fuzzer.get_fuzz_job(id)
  }

  pub async fn stop_fuzz(&self, id: JobId) -> Result<()> {
    self.fuzzer.stop_fuzz(id)
  }

  pub async fn start_discovery(
    &self,
    base_url: &str,
    words: &[String],
    extensions: &[String],
    concurrency: usize,
  ) -> Result<JobId> {
    self
      .fuzzer
      .start_discovery(base_url, words, extensions, concurrency)
      .await
  }

  // events and certificates

  pub fn subscribe(&self) -> Subscription {
    self.state.events.subscribe()
  }

  pub fn events(&self) -> EventBus {
    self.state.events.clone()
  }

  pub fn ca_cert_pem(&self) -> String {
    self.state.certs.ca_cert_pem().to_string()
  }

  pub fn ca_cert_path(&self) -> PathBuf {
    self.state.certs.ca_cert_path()
  }

  // listener

  /// Bind the configured listen address.
  pub async fn bind(&self) -> Result<ProxyServer> {
    self.bind_to(self.config.listen_addr).await
  }

  pub async fn bind_to(&self, addr: SocketAddr) -> Result<ProxyServer> {
    ProxyServer::bind(addr, self.state.clone()).await
  }

  /// Bind and serve until the listener fails.
  pub async fn start(&self) -> Result<()> {
    self.bind().await?.run().await
  }
}
