//! Fan-out of state changes to observers.
//!
//! Every subscriber owns a bounded queue. When a subscriber falls behind, the
//! oldest events are discarded for that subscriber only; publishers never wait.
use crate::fuzz::{FuzzResult, FuzzStatus};
use crate::ids::{JobId, MessageId, SessionId};
use crate::intercept::{InterceptPhase, Resolution};
use crate::message::MessageSummary;
use crate::scan::{Finding, SessionStatus};
use serde::Serialize;
use tokio::sync::broadcast;

/// Events delivered as `{"type": ..., "data": ...}`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Event {
  NewMessage(MessageSummary),
  InterceptPending {
    message: MessageSummary,
    phase: InterceptPhase,
  },
  InterceptResolved {
    id: MessageId,
    phase: InterceptPhase,
    decision: &'static str,
    resolution: Resolution,
  },
  Finding(Box<Finding>),
  ScanProgress {
    session_id: SessionId,
    progress: u8,
    status: SessionStatus,
  },
  ScanCompleted {
    session_id: SessionId,
    status: SessionStatus,
    findings: usize,
  },
  FuzzResult {
    job_id: JobId,
    result: FuzzResult,
  },
  FuzzCompleted {
    job_id: JobId,
    status: FuzzStatus,
  },
}

impl Event {
  /// The `type` tag.
  pub fn kind(&self) -> &'static str {
    match self {
      Event::NewMessage(_) => "new-message",
      Event::InterceptPending { .. } => "intercept-pending",
      Event::InterceptResolved { .. } => "intercept-resolved",
      Event::Finding(_) => "finding",
      Event::ScanProgress { .. } => "scan-progress",
      Event::ScanCompleted { .. } => "scan-completed",
      Event::FuzzResult { .. } => "fuzz-result",
      Event::FuzzCompleted { .. } => "fuzz-completed",
    }
  }
}

/// Cloneable handle to the bus.
#[derive(Clone)]
pub struct EventBus {
  sender: broadcast::Sender<Event>,
}

impl EventBus {
  /// `capacity` is the per-subscriber queue length.
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { sender }
  }

  pub fn publish(&self, event: Event) {
    let kind = event.kind();
    if self.sender.send(event).is_err() {
      tracing::trace!(kind, "no subscribers");
    }
  }

  pub fn subscribe(&self) -> Subscription {
    Subscription {
      receiver: self.sender.subscribe(),
      lost: 0,
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.sender.receiver_count()
  }
}

/// A subscriber's end of the bus. Dropping it unsubscribes.
pub struct Subscription {
  receiver: broadcast::Receiver<Event>,
  lost: u64,
}

impl Subscription {
  /// Next event, or `None` once the bus is gone.
  pub async fn recv(&mut self) -> Option<Event> {
    loop {
      match self.receiver.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(n)) => {
          self.lost += n;
          tracing::warn!(lost = n, "event subscriber lagged, oldest events dropped");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Next event if one is queued.
  pub fn try_recv(&mut self) -> Option<Event> {
    loop {
      match self.receiver.try_recv() {
        Ok(event) => return Some(event),
        Err(broadcast::error::TryRecvError::Lagged(n)) => {
          self.lost += n;
          tracing::warn!(lost = n, "event subscriber lagged, oldest events dropped");
        }
        Err(_) => return None,
      }
    }
  }

  /// Events discarded for this subscriber so far.
  pub fn lost(&self) -> u64 {
    self.lost
  }
}
