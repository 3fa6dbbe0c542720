//! Passive and active scanning.
//!
//! Passive checks analyze captured exchanges. Active checks derive probe
//! requests from captured exchanges, send them through the shared client path
//! and analyze the responses. Active probes of every session share one
//! bounded worker pool.
pub mod active;
mod finding;
pub mod passive;
mod session;
mod signatures;

pub use active::{ActiveCheck, Probe};
pub use finding::{owasp, Detection, Finding, Severity};
pub use passive::PassiveCheck;
pub use session::{ScanProfile, ScanSession, SessionStatus};

use crate::client::Transport;
use crate::errors::{Error, Result};
use crate::events::{Event, EventBus};
use crate::ids::{MessageId, SessionId};
use crate::message::{Marker, Message, MessageFilter, Source};
use crate::request::{HttpRequest, Url};
use crate::response::HttpResponse;
use crate::storage::Storage;
use http::Method;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Worker pool and probe limits.
#[derive(Clone, Copy, Debug)]
pub struct ScanSettings {
  /// Probes in flight across all sessions.
  pub concurrency: usize,
  pub probe_timeout: Duration,
}

impl Default for ScanSettings {
  fn default() -> Self {
    Self {
      concurrency: 8,
      probe_timeout: Duration::from_secs(10),
    }
  }
}

/// Live-traffic findings remembered for de-duplication.
const LIVE_REPORT_MEMORY: usize = 4096;

struct SessionHandle {
  scope: Url,
  session: tokio::sync::Mutex<ScanSession>,
  scheduled: std::sync::atomic::AtomicUsize,
  cancel: watch::Sender<bool>,
  /// Categories already reported per message. Cleared when the run ends.
  reported: Mutex<HashSet<ReportKey>>,
}

/// One piece of scheduled work: a check against a base message.
enum Unit {
  Passive { check: usize, base: usize },
  Active { check: usize, base: usize, probe: Probe },
}

type ReportKey = (MessageId, &'static str);

/// Bounded memory of findings reported outside any session.
#[derive(Default)]
struct LiveReports {
  keys: HashSet<ReportKey>,
  order: VecDeque<ReportKey>,
}

impl LiveReports {
  fn insert(&mut self, key: ReportKey) -> bool {
    if !self.keys.insert(key) {
      return false;
    }
    self.order.push_back(key);
    while self.order.len() > LIVE_REPORT_MEMORY {
      if let Some(old) = self.order.pop_front() {
        self.keys.remove(&old);
      }
    }
    true
  }
}

pub struct ScanEngine {
  transport: Arc<dyn Transport>,
  storage: Arc<dyn Storage>,
  events: EventBus,
  passive: Vec<Box<dyn PassiveCheck>>,
  active: Vec<Box<dyn ActiveCheck>>,
  pool: Arc<Semaphore>,
  probe_timeout: Duration,
  sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
  live_reports: Mutex<LiveReports>,
}

impl ScanEngine {
  pub fn new(
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    settings: ScanSettings,
  ) -> Self {
    Self {
      transport,
      storage,
      events,
      passive: passive::default_checks(),
      active: active::default_checks(),
      pool: Arc::new(Semaphore::new(settings.concurrency.max(1))),
      probe_timeout: settings.probe_timeout,
      sessions: RwLock::new(HashMap::new()),
      live_reports: Mutex::new(LiveReports::default()),
    }
  }

  /// Replace the shipped checks.
  pub fn with_checks(
    mut self,
    passive: Vec<Box<dyn PassiveCheck>>,
    active: Vec<Box<dyn ActiveCheck>>,
  ) -> Self {
    self.passive = passive;
    self.active = active;
    self
  }

  pub fn active_check_names(&self) -> Vec<&'static str> {
    self.active.iter().map(|c| c.name()).collect()
  }

  fn handle(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
    self
      .sessions
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&id)
      .cloned()
  }

  fn handles(&self) -> Vec<Arc<SessionHandle>> {
    self
      .sessions
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .cloned()
      .collect()
  }

  /// Create a session for `target` and start running it in the background.
  pub async fn start_scan(self: &Arc<Self>, target: &str, profile: ScanProfile) -> Result<SessionId> {
    let scope = Url::parse(target)?;
    let enabled = self.enabled_active(&profile)?;
    let mut session = ScanSession::new(scope.clone(), profile);
    session.transition(SessionStatus::Running)?;
    let id = session.id;
    self.storage.put_session(session.clone()).await?;
    let (cancel, _) = watch::channel(false);
    let handle = Arc::new(SessionHandle {
      scope,
      session: tokio::sync::Mutex::new(session),
      scheduled: Default::default(),
      cancel,
      reported: Mutex::new(HashSet::new()),
    });
    self
      .sessions
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id, handle.clone());
    tracing::info!(session = %id, url = target, "scan started");
    self.events.publish(Event::ScanProgress {
      session_id: id,
      progress: 0,
      status: SessionStatus::Running,
    });
    let engine = self.clone();
    tokio::spawn(async move {
      engine.run(handle, enabled).await;
    });
    Ok(id)
  }

  /// Indexes of the active checks a profile enables.
  fn enabled_active(&self, profile: &ScanProfile) -> Result<Vec<usize>> {
    let names = match profile.active_checks() {
      None => return Ok((0..self.active.len()).collect()),
      Some(names) => names,
    };
    let mut enabled = Vec::new();
    for name in names {
      match self.active.iter().position(|c| c.name() == name) {
        Some(i) => enabled.push(i),
        None => return Err(Error::invalid(format!("unknown active check {:?}", name))),
      }
    }
    Ok(enabled)
  }

  /// Stop issuing probes for a running session. In-flight probes finish.
  pub async fn cancel_scan(&self, id: SessionId) -> Result<()> {
    let handle = self
      .handle(id)
      .ok_or_else(|| Error::not_found(format!("scan session {}", id)))?;
    let snapshot = {
      let mut session = handle.session.lock().await;
      session.transition(SessionStatus::Cancelled)?;
      self.store(&session).await;
      session.clone()
    };
    handle.cancel.send_replace(true);
    tracing::info!(session = %id, progress = snapshot.progress, "scan cancelled");
    self.events.publish(Event::ScanCompleted {
      session_id: id,
      status: SessionStatus::Cancelled,
      findings: snapshot.findings_count,
    });
    Ok(())
  }

  pub async fn get_session(&self, id: SessionId) -> Result<ScanSession> {
    self.storage.session(id).await
  }

  pub async fn list_sessions(&self) -> Result<Vec<ScanSession>> {
    self.storage.sessions().await
  }

  pub async fn list_findings(&self, session: Option<SessionId>) -> Result<Vec<Finding>> {
    self.storage.findings(session).await
  }

  /// Run passive checks over a live exchange. Findings are attributed to every
  /// running session whose scope covers the message, or recorded without a
  /// session when none does.
  pub async fn observe(&self, message: &Message) {
    if message.source == Source::Scanner || message.marker != Marker::Completed {
      return;
    }
    if message.response.is_none() {
      return;
    }
    let mut targets = Vec::new();
    for handle in self.handles() {
      if message.url.in_scope(&handle.scope)
        && handle.session.lock().await.status == SessionStatus::Running
      {
        targets.push(handle);
      }
    }
    for check in &self.passive {
      let detection = match check.check(message) {
        Ok(Some(d)) => d,
        Ok(None) => continue,
        Err(e) => {
          let error = Error::ScanCheck(format!("{} on {}: {}", check.name(), message.id, e));
          tracing::warn!(message = %message.id, error = %error, "passive check failed on live traffic");
          continue;
        }
      };
      if targets.is_empty() {
        self.report(None, message, detection).await;
        continue;
      }
      for handle in &targets {
        self.report(Some(handle), message, detection.clone()).await;
      }
    }
  }

  /// Record a detection unless the same category was already reported for
  /// this message in this session.
  async fn report(&self, handle: Option<&Arc<SessionHandle>>, message: &Message, detection: Detection) {
    let session_id = match handle {
      Some(h) => Some(h.session.lock().await.id),
      None => None,
    };
    let key = (message.id, detection.category);
    let fresh = match handle {
      Some(h) => h.reported.lock().unwrap_or_else(PoisonError::into_inner).insert(key),
      None => self
        .live_reports
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key),
    };
    if !fresh {
      tracing::trace!(message = %message.id, category = detection.category, "duplicate finding suppressed");
      return;
    }
    let finding = Finding::from_detection(message, session_id, detection);
    tracing::info!(
      message = %message.id,
      category = %finding.category,
      severity = %finding.severity,
      "finding"
    );
    if let Err(e) = self.storage.append_finding(finding.clone()).await {
      tracing::warn!(error = %e, "failed to store finding");
      return;
    }
    if let Some(h) = handle {
      // stored under the lock so a later transition is never overwritten
      let mut session = h.session.lock().await;
      session.findings_count += 1;
      self.store(&session).await;
    }
    self.events.publish(Event::Finding(Box::new(finding)));
  }

  async fn run(self: Arc<Self>, handle: Arc<SessionHandle>, enabled: Vec<usize>) {
    let id = handle.session.lock().await.id;
    let seed = match self.seed(&handle.scope).await {
      Ok(seed) => seed,
      Err(message) => {
        self.fail(&handle, message).await;
        return;
      }
    };

    let mut bases = vec![Arc::new(seed)];
    let history = self
      .storage
      .messages(&MessageFilter::default())
      .await
      .unwrap_or_default();
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(format!("{} {}", bases[0].method(), bases[0].url));
    for m in history {
      let usable = m.source != Source::Scanner
        && m.marker == Marker::Completed
        && m.response.is_some()
        && m.url.in_scope(&handle.scope);
      if usable && seen.insert(format!("{} {}", m.method(), m.url)) {
        bases.push(Arc::new(m));
      }
    }

    let mut units = Vec::new();
    for base in 0..bases.len() {
      for check in 0..self.passive.len() {
        units.push(Unit::Passive { check, base });
      }
    }
    for &check in &enabled {
      let per_host = self.active[check].per_host();
      for (base, message) in bases.iter().enumerate() {
        if per_host && base > 0 {
          break;
        }
        for probe in self.active[check].probes(message) {
          units.push(Unit::Active { check, base, probe });
        }
      }
    }
    handle
      .scheduled
      .store(units.len(), std::sync::atomic::Ordering::SeqCst);
    tracing::debug!(session = %id, bases = bases.len(), units = units.len(), "scan scheduled");

    let mut cancelled = handle.cancel.subscribe();
    let mut in_flight = JoinSet::new();
    for unit in units {
      let stop = *cancelled.borrow();
      if stop {
        break;
      }
      match unit {
        Unit::Passive { check, base } => {
          let outcome = self.run_passive(&handle, check, &bases[base]).await;
          self.complete_unit(&handle, outcome).await;
        }
        Unit::Active { check, base, probe } => {
          let permit = tokio::select! {
            permit = self.pool.clone().acquire_owned() => match permit {
              Ok(p) => p,
              Err(_) => break,
            },
            _ = cancelled.changed() => break,
          };
          let engine = self.clone();
          let handle = handle.clone();
          let base = bases[base].clone();
          in_flight.spawn(async move {
            let _permit = permit;
            let outcome = engine.run_probe(&handle, check, &base, probe).await;
            engine.complete_unit(&handle, outcome).await;
          });
        }
      }
    }
    while in_flight.join_next().await.is_some() {}
    handle
      .reported
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();

    let snapshot = {
      let mut session = handle.session.lock().await;
      if session.status != SessionStatus::Running {
        return;
      }
      if let Err(e) = session.transition(SessionStatus::Completed) {
        tracing::warn!(session = %id, error = %e, "scan could not complete");
        return;
      }
      self.store(&session).await;
      session.clone()
    };
    tracing::info!(
      session = %id,
      findings = snapshot.findings_count,
      executed = snapshot.checks_executed,
      skipped = snapshot.checks_skipped,
      "scan completed"
    );
    self.events.publish(Event::ScanProgress {
      session_id: id,
      progress: snapshot.progress,
      status: snapshot.status,
    });
    self.events.publish(Event::ScanCompleted {
      session_id: id,
      status: SessionStatus::Completed,
      findings: snapshot.findings_count,
    });
  }

  /// Fetch the scope root. An unreachable target yields the failure reason.
  async fn seed(&self, scope: &Url) -> std::result::Result<Message, String> {
    let request = HttpRequest::new(Method::GET, scope);
    let mut seed = Message::new(scope.clone(), request, Source::Scanner);
    let started = Instant::now();
    let result = self.transport.send(scope, &seed.request).await;
    seed.latency_ms = Some(started.elapsed().as_millis() as u64);
    let failure = match result {
      Ok(response) => {
        seed.response = Some(response);
        None
      }
      Err(e) => {
        let kind = e.upstream_kind().unwrap_or(crate::errors::UpstreamFailure::Protocol);
        seed.response = Some(HttpResponse::upstream_error(kind, &e.to_string()));
        seed.marker = Marker::UpstreamError(kind);
        Some(format!("target unreachable: {}", e))
      }
    };
    if let Err(e) = self.storage.append_message(seed.clone()).await {
      tracing::warn!(error = %e, "failed to store seed message");
    }
    self.events.publish(Event::NewMessage(seed.summary()));
    match failure {
      Some(reason) => Err(reason),
      None => Ok(seed),
    }
  }

  async fn fail(&self, handle: &SessionHandle, reason: String) {
    let snapshot = {
      let mut session = handle.session.lock().await;
      if session.transition(SessionStatus::Failed).is_err() {
        return;
      }
      session.error = Some(reason);
      self.store(&session).await;
      session.clone()
    };
    tracing::warn!(session = %snapshot.id, reason = ?snapshot.error, "scan failed");
    self.events.publish(Event::ScanCompleted {
      session_id: snapshot.id,
      status: SessionStatus::Failed,
      findings: snapshot.findings_count,
    });
  }

  async fn run_passive(&self, handle: &Arc<SessionHandle>, check: usize, base: &Message) -> bool {
    let check = &self.passive[check];
    match check.check(base) {
      Ok(Some(detection)) => {
        self.report(Some(handle), base, detection).await;
        true
      }
      Ok(None) => true,
      Err(e) => {
        skipped(Error::ScanCheck(format!("{} on {}: {}", check.name(), base.id, e)));
        false
      }
    }
  }

  /// Send one probe and analyze its response. Returns false when the check was skipped.
  async fn run_probe(&self, handle: &Arc<SessionHandle>, check: usize, base: &Message, probe: Probe) -> bool {
    let check = &self.active[check];
    let sent = tokio::time::timeout(self.probe_timeout, self.transport.send(&probe.url, &probe.request)).await;
    let response = match sent {
      Ok(Ok(response)) => response,
      Ok(Err(e)) => {
        skipped(Error::ScanCheck(format!("{} probe {} failed: {}", check.name(), probe.url, e)));
        return false;
      }
      Err(_) => {
        skipped(Error::ScanCheck(format!("{} probe {} timed out", check.name(), probe.url)));
        return false;
      }
    };
    if response.is_synthetic() {
      return false;
    }
    if let Some(detection) = check.analyze(base, &probe, &response) {
      self.report(Some(handle), base, detection).await;
    }
    true
  }

  async fn complete_unit(&self, handle: &SessionHandle, executed: bool) {
    let scheduled = handle.scheduled.load(std::sync::atomic::Ordering::SeqCst);
    // progress events go out in lock order
    let mut session = handle.session.lock().await;
    if executed {
      session.checks_executed += 1;
    } else {
      session.checks_skipped += 1;
    }
    let done = session.checks_executed + session.checks_skipped;
    if session.advance(done, scheduled) {
      self.store(&session).await;
      self.events.publish(Event::ScanProgress {
        session_id: session.id,
        progress: session.progress,
        status: session.status,
      });
    }
  }

  /// Persist a session record. Callers hold the session lock so stores land
  /// in transition order.
  async fn store(&self, session: &ScanSession) {
    if let Err(e) = self.storage.put_session(session.clone()).await {
      tracing::warn!(session = %session.id, error = %e, "failed to store scan session");
    }
  }
}

/// Log a check that could not run. The caller counts it as skipped.
fn skipped(error: Error) {
  tracing::warn!(error = %error, "scan check skipped");
}
