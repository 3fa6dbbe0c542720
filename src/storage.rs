//! Append-only store for messages, findings, scan sessions and fuzz results.
use crate::errors::{Error, Result};
use crate::fuzz::FuzzResult;
use crate::ids::{JobId, MessageId, SessionId};
use crate::message::{Message, MessageFilter};
use crate::scan::{Finding, ScanSession};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Storage injected into every component that records state.
///
/// Reads return point-in-time snapshots; each write is atomic per record.
#[async_trait]
pub trait Storage: Send + Sync {
  async fn append_message(&self, message: Message) -> Result<()>;
  async fn message(&self, id: MessageId) -> Result<Message>;
  /// Messages matching `filter`, oldest first.
  async fn messages(&self, filter: &MessageFilter) -> Result<Vec<Message>>;
  async fn remove_message(&self, id: MessageId) -> Result<()>;

  async fn append_finding(&self, finding: Finding) -> Result<()>;
  /// Findings of one session, or all findings when `session` is `None`.
  async fn findings(&self, session: Option<SessionId>) -> Result<Vec<Finding>>;

  /// Insert or replace a session record.
  async fn put_session(&self, session: ScanSession) -> Result<()>;
  async fn session(&self, id: SessionId) -> Result<ScanSession>;
  async fn sessions(&self) -> Result<Vec<ScanSession>>;

  async fn append_fuzz_result(&self, job: JobId, result: FuzzResult) -> Result<()>;
  async fn fuzz_results(&self, job: JobId) -> Result<Vec<FuzzResult>>;
}

#[derive(Default)]
struct Tables {
  messages: Vec<Message>,
  findings: Vec<Finding>,
  sessions: Vec<ScanSession>,
  fuzz_results: HashMap<JobId, Vec<FuzzResult>>,
}

/// In-process storage preserving insertion order.
#[derive(Default)]
pub struct MemoryStorage {
  tables: RwLock<Tables>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Storage for MemoryStorage {
  async fn append_message(&self, message: Message) -> Result<()> {
    self.tables.write().await.messages.push(message);
    Ok(())
  }

  async fn message(&self, id: MessageId) -> Result<Message> {
    self
      .tables
      .read()
      .await
      .messages
      .iter()
      .find(|m| m.id == id)
      .cloned()
      .ok_or_else(|| Error::not_found(format!("message {}", id)))
  }

  async fn messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
    Ok(
      self
        .tables
        .read()
        .await
        .messages
        .iter()
        .filter(|m| filter.matches(m))
        .cloned()
        .collect(),
    )
  }

  async fn remove_message(&self, id: MessageId) -> Result<()> {
    let mut tables = self.tables.write().await;
    let before = tables.messages.len();
    tables.messages.retain(|m| m.id != id);
    if tables.messages.len() == before {
      return Err(Error::not_found(format!("message {}", id)));
    }
    Ok(())
  }

  async fn append_finding(&self, finding: Finding) -> Result<()> {
    self.tables.write().await.findings.push(finding);
    Ok(())
  }

  async fn findings(&self, session: Option<SessionId>) -> Result<Vec<Finding>> {
    Ok(
      self
        .tables
        .read()
        .await
        .findings
        .iter()
        .filter(|f| session.is_none() || f.session_id == session)
        .cloned()
        .collect(),
    )
  }

  async fn put_session(&self, session: ScanSession) -> Result<()> {
    let mut tables = self.tables.write().await;
    match tables.sessions.iter_mut().find(|s| s.id == session.id) {
      Some(existing) => *existing = session,
      None => tables.sessions.push(session),
    }
    Ok(())
  }

  async fn session(&self, id: SessionId) -> Result<ScanSession> {
    self
      .tables
      .read()
      .await
      .sessions
      .iter()
      .find(|s| s.id == id)
      .cloned()
      .ok_or_else(|| Error::not_found(format!("scan session {}", id)))
  }

  async fn sessions(&self) -> Result<Vec<ScanSession>> {
    Ok(self.tables.read().await.sessions.clone())
  }

  async fn append_fuzz_result(&self, job: JobId, result: FuzzResult) -> Result<()> {
    self
      .tables
      .write()
      .await
      .fuzz_results
      .entry(job)
      .or_default()
      .push(result);
    Ok(())
  }

  async fn fuzz_results(&self, job: JobId) -> Result<Vec<FuzzResult>> {
    Ok(
      self
        .tables
        .read()
        .await
        .fuzz_results
        .get(&job)
        .cloned()
        .unwrap_or_default(),
    )
  }
}
