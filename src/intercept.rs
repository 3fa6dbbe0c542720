//! Pause/edit/forward queue for in-flight messages.
//!
//! A held message blocks only its own connection. Each held message receives
//! exactly one decision: from `decide`, from the timeout default, from the
//! flush when interception is switched off, or from the client going away.
use crate::errors::{Error, Result};
use crate::events::{Event, EventBus};
use crate::ids::MessageId;
use crate::message::{now_millis, Message};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// How many consumed decisions are remembered for idempotent `decide` calls.
const RESOLVED_MEMORY: usize = 4096;

/// The verdict for a held message.
#[derive(Clone, Debug)]
pub enum InterceptDecision {
  Forward,
  /// Continue with this request (request phase) or response (response phase) instead.
  ForwardEdited(Box<Message>),
  Drop,
}

impl InterceptDecision {
  pub fn label(&self) -> &'static str {
    match self {
      InterceptDecision::Forward => "forward",
      InterceptDecision::ForwardEdited(_) => "forward-edited",
      InterceptDecision::Drop => "drop",
    }
  }
}

/// Decision applied when nobody decides in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultDecision {
  #[default]
  Forward,
  Drop,
}

impl From<DefaultDecision> for InterceptDecision {
  fn from(value: DefaultDecision) -> Self {
    match value {
      DefaultDecision::Forward => InterceptDecision::Forward,
      DefaultDecision::Drop => InterceptDecision::Drop,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptPhase {
  Request,
  Response,
}

/// How a held message was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
  Decided,
  Timeout,
  Flushed,
  ClientClosed,
}

/// Result of a `decide` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecideOutcome {
  Applied,
  /// The message had already been released; nothing changed.
  AlreadyResolved,
}

/// Messages that are never held.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptFilter {
  /// Path extensions, lower case without the dot.
  pub skip_extensions: Vec<String>,
  /// Content-type prefixes.
  pub skip_content_types: Vec<String>,
}

impl Default for InterceptFilter {
  fn default() -> Self {
    Self {
      skip_extensions: [
        "css", "js", "png", "jpg", "jpeg", "gif", "ico", "svg", "webp", "woff", "woff2", "ttf",
        "eot", "map", "mp4",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      skip_content_types: ["image/", "font/", "video/", "audio/"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
  }
}

impl InterceptFilter {
  /// Whether `message` bypasses the queue in `phase`.
  pub fn excludes(&self, message: &Message, phase: InterceptPhase) -> bool {
    if let Some(ext) = message.url.extension() {
      if self.skip_extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)) {
        return true;
      }
    }
    let content_type = match phase {
      InterceptPhase::Request => message.request.headers.get("content-type"),
      InterceptPhase::Response => message.response.as_ref().and_then(|r| r.content_type()),
    };
    match content_type {
      Some(ct) => {
        let ct = ct.to_ascii_lowercase();
        self
          .skip_content_types
          .iter()
          .any(|prefix| ct.starts_with(&prefix.to_ascii_lowercase()))
      }
      None => false,
    }
  }
}

/// Queue settings.
#[derive(Clone, Debug)]
pub struct InterceptSettings {
  pub timeout: Duration,
  pub default_decision: DefaultDecision,
  pub intercept_responses: bool,
  pub filter: InterceptFilter,
}

impl Default for InterceptSettings {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(60),
      default_decision: DefaultDecision::Forward,
      intercept_responses: false,
      filter: InterceptFilter::default(),
    }
  }
}

/// A message waiting for a decision.
#[derive(Clone, Debug, Serialize)]
pub struct PendingIntercept {
  pub message: Message,
  pub phase: InterceptPhase,
  /// When the message entered the queue, in epoch milliseconds.
  pub since: u64,
}

struct Pending {
  message: Message,
  phase: InterceptPhase,
  arrival: u64,
  since: u64,
  sender: oneshot::Sender<InterceptDecision>,
}

#[derive(Default)]
struct QueueState {
  pending: HashMap<MessageId, Pending>,
  resolved: HashSet<MessageId>,
  resolved_order: VecDeque<MessageId>,
  arrivals: u64,
}

impl QueueState {
  fn mark_resolved(&mut self, id: MessageId) {
    if self.resolved.insert(id) {
      self.resolved_order.push_back(id);
      while self.resolved_order.len() > RESOLVED_MEMORY {
        if let Some(old) = self.resolved_order.pop_front() {
          self.resolved.remove(&old);
        }
      }
    }
  }
}

pub struct InterceptQueue {
  enabled: AtomicBool,
  settings: InterceptSettings,
  state: Mutex<QueueState>,
  events: EventBus,
}

impl InterceptQueue {
  pub fn new(settings: InterceptSettings, events: EventBus) -> Self {
    Self {
      enabled: AtomicBool::new(false),
      settings,
      state: Mutex::new(QueueState::default()),
      events,
    }
  }

  fn lock(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::SeqCst)
  }

  /// Switch interception. Turning it off releases every held message unmodified;
  /// returns how many were released.
  pub fn set_enabled(&self, enabled: bool) -> usize {
    self.enabled.store(enabled, Ordering::SeqCst);
    tracing::info!(enabled, "interception toggled");
    if enabled {
      return 0;
    }
    let drained: Vec<Pending> = {
      let mut state = self.lock();
      let ids: Vec<MessageId> = state.pending.keys().copied().collect();
      let mut drained = Vec::with_capacity(ids.len());
      for id in ids {
        if let Some(p) = state.pending.remove(&id) {
          state.mark_resolved(id);
          drained.push(p);
        }
      }
      drained
    };
    let count = drained.len();
    for p in drained {
      let id = p.message.id;
      if p.sender.send(InterceptDecision::Forward).is_ok() {
        self.events.publish(Event::InterceptResolved {
          id,
          phase: p.phase,
          decision: InterceptDecision::Forward.label(),
          resolution: Resolution::Flushed,
        });
      }
    }
    count
  }

  /// Whether `message` should be held in `phase`.
  pub fn should_hold(&self, message: &Message, phase: InterceptPhase) -> bool {
    self.is_enabled()
      && (phase == InterceptPhase::Request || self.settings.intercept_responses)
      && !self.settings.filter.excludes(message, phase)
  }

  /// Hold `message` until a decision arrives or the timeout applies the default.
  ///
  /// Dropping the returned future (the client went away) removes the message
  /// from the queue.
  pub async fn hold(&self, message: Message, phase: InterceptPhase) -> InterceptDecision {
    let id = message.id;
    let summary = message.summary();
    let (sender, mut receiver) = oneshot::channel();
    {
      let mut state = self.lock();
      state.arrivals += 1;
      let arrival = state.arrivals;
      state.resolved.remove(&id);
      state.pending.insert(
        id,
        Pending {
          message,
          phase,
          arrival,
          since: now_millis(),
          sender,
        },
      );
    }
    tracing::debug!(%id, ?phase, "message held for a decision");
    self.events.publish(Event::InterceptPending {
      message: summary,
      phase,
    });
    let mut guard = PendingGuard {
      queue: self,
      id,
      phase,
      armed: true,
    };
    let default: InterceptDecision = self.settings.default_decision.into();
    let decision = match tokio::time::timeout(self.settings.timeout, &mut receiver).await {
      Ok(Ok(decision)) => decision,
      Ok(Err(_)) => default,
      Err(_) => {
        let expired = {
          let mut state = self.lock();
          let expired = state.pending.remove(&id);
          if expired.is_some() {
            state.mark_resolved(id);
          }
          expired
        };
        if expired.is_some() {
          tracing::info!(%id, decision = default.label(), "intercept timed out, default applied");
          self.events.publish(Event::InterceptResolved {
            id,
            phase,
            decision: default.label(),
            resolution: Resolution::Timeout,
          });
          default
        } else {
          // a decision raced the timer
          receiver.await.unwrap_or(default)
        }
      }
    };
    guard.armed = false;
    decision
  }

  /// Apply a decision to a held message.
  ///
  /// Deciding an already released message is a no-op; an id that was never
  /// held is an error.
  pub fn decide(&self, id: MessageId, decision: InterceptDecision) -> Result<DecideOutcome> {
    let pending = {
      let mut state = self.lock();
      match state.pending.remove(&id) {
        Some(p) => {
          state.mark_resolved(id);
          p
        }
        None if state.resolved.contains(&id) => return Ok(DecideOutcome::AlreadyResolved),
        None => return Err(Error::not_found(format!("no intercepted message {}", id))),
      }
    };
    let label = decision.label();
    if pending.sender.send(decision).is_err() {
      return Ok(DecideOutcome::AlreadyResolved);
    }
    tracing::debug!(%id, decision = label, "intercept decided");
    self.events.publish(Event::InterceptResolved {
      id,
      phase: pending.phase,
      decision: label,
      resolution: Resolution::Decided,
    });
    Ok(DecideOutcome::Applied)
  }

  /// Held messages in arrival order.
  pub fn pending(&self) -> Vec<PendingIntercept> {
    let state = self.lock();
    let mut pending: Vec<(&u64, PendingIntercept)> = state
      .pending
      .values()
      .map(|p| {
        (
          &p.arrival,
          PendingIntercept {
            message: p.message.clone(),
            phase: p.phase,
            since: p.since,
          },
        )
      })
      .collect();
    pending.sort_by_key(|(arrival, _)| **arrival);
    pending.into_iter().map(|(_, p)| p).collect()
  }

  pub fn pending_count(&self) -> usize {
    self.lock().pending.len()
  }
}

/// Removes a held message whose waiter was dropped.
struct PendingGuard<'a> {
  queue: &'a InterceptQueue,
  id: MessageId,
  phase: InterceptPhase,
  armed: bool,
}

impl Drop for PendingGuard<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let removed = {
      let mut state = self.queue.lock();
      let removed = state.pending.remove(&self.id).is_some();
      if removed {
        state.mark_resolved(self.id);
      }
      removed
    };
    if removed {
      tracing::debug!(id = %self.id, "client closed while held");
      self.queue.events.publish(Event::InterceptResolved {
        id: self.id,
        phase: self.phase,
        decision: InterceptDecision::Drop.label(),
        resolution: Resolution::ClientClosed,
      });
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::Source;
  use crate::request::{HttpRequest, Url};
  use http::Method;
  use std::sync::Arc;

  fn message(url: &str) -> Message {
    let url = Url::parse(url).unwrap();
    Message::new(url.clone(), HttpRequest::new(Method::GET, &url), Source::Proxy)
  }

  fn queue(timeout: Duration, default_decision: DefaultDecision) -> Arc<InterceptQueue> {
    let settings = InterceptSettings {
      timeout,
      default_decision,
      ..Default::default()
    };
    let queue = Arc::new(InterceptQueue::new(settings, EventBus::new(64)));
    queue.set_enabled(true);
    queue
  }

  async fn wait_pending(queue: &InterceptQueue, n: usize) {
    for _ in 0..200 {
      if queue.pending_count() >= n {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("message never reached the queue");
  }

  #[test]
  fn static_assets_are_not_held() {
    let q = queue(Duration::from_secs(1), DefaultDecision::Forward);
    assert!(!q.should_hold(&message("http://a.test/site.css"), InterceptPhase::Request));
    assert!(q.should_hold(&message("http://a.test/login"), InterceptPhase::Request));
    assert!(!q.should_hold(&message("http://a.test/login"), InterceptPhase::Response));
  }

  #[tokio::test]
  async fn second_decide_is_a_noop() {
    let q = queue(Duration::from_secs(5), DefaultDecision::Forward);
    let m = message("http://a.test/");
    let id = m.id;
    let holder = {
      let q = q.clone();
      tokio::spawn(async move { q.hold(m, InterceptPhase::Request).await })
    };
    wait_pending(&q, 1).await;
    assert_eq!(q.decide(id, InterceptDecision::Drop).unwrap(), DecideOutcome::Applied);
    assert_eq!(
      q.decide(id, InterceptDecision::Forward).unwrap(),
      DecideOutcome::AlreadyResolved
    );
    assert!(matches!(holder.await.unwrap(), InterceptDecision::Drop));
    assert!(q.decide(MessageId::new(), InterceptDecision::Forward).is_err());
  }

  #[tokio::test]
  async fn timeout_applies_the_default_once() {
    let q = queue(Duration::from_millis(50), DefaultDecision::Drop);
    let m = message("http://a.test/");
    let id = m.id;
    let decision = q.hold(m, InterceptPhase::Request).await;
    assert!(matches!(decision, InterceptDecision::Drop));
    assert_eq!(q.pending_count(), 0);
    assert_eq!(
      q.decide(id, InterceptDecision::Forward).unwrap(),
      DecideOutcome::AlreadyResolved
    );
  }

  #[tokio::test]
  async fn disabling_flushes_everything_forward() {
    let q = queue(Duration::from_secs(30), DefaultDecision::Drop);
    let mut holders = Vec::new();
    for path in ["/a", "/b", "/c"] {
      let q = q.clone();
      let m = message(&format!("http://a.test{}", path));
      holders.push(tokio::spawn(async move { q.hold(m, InterceptPhase::Request).await }));
    }
    wait_pending(&q, 3).await;
    let pending: Vec<String> = q.pending().iter().map(|p| p.message.url.path.clone()).collect();
    assert_eq!(pending.len(), 3);
    assert_eq!(q.set_enabled(false), 3);
    for h in holders {
      assert!(matches!(h.await.unwrap(), InterceptDecision::Forward));
    }
  }

  #[tokio::test]
  async fn dropped_waiter_leaves_the_queue() {
    let q = queue(Duration::from_secs(30), DefaultDecision::Forward);
    let m = message("http://a.test/");
    let id = m.id;
    let _ = tokio::time::timeout(Duration::from_millis(20), q.hold(m, InterceptPhase::Request)).await;
    assert_eq!(q.pending_count(), 0);
    assert_eq!(
      q.decide(id, InterceptDecision::Forward).unwrap(),
      DecideOutcome::AlreadyResolved
    );
  }
}
