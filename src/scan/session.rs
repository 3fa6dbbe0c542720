use crate::errors::{Error, Result};
use crate::ids::SessionId;
use crate::message::now_millis;
use crate::request::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which active checks a session runs. Passive checks always run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanProfile {
  Quick,
  Deep,
  Owasp,
  /// Named active checks.
  Custom(Vec<String>),
}

impl ScanProfile {
  /// Active check names enabled by this profile; `None` means all.
  pub fn active_checks(&self) -> Option<Vec<&str>> {
    match self {
      ScanProfile::Quick => Some(vec!["reflected-input"]),
      ScanProfile::Owasp => Some(vec![
        "reflected-input",
        "xss",
        "sql-injection",
        "path-traversal",
        "open-redirect",
      ]),
      ScanProfile::Deep => None,
      ScanProfile::Custom(names) => Some(names.iter().map(|s| s.as_str()).collect()),
    }
  }
}

impl FromStr for ScanProfile {
  type Err = Error;

  /// `quick`, `deep`, `owasp` or `custom:check-a,check-b`.
  fn from_str(s: &str) -> Result<Self> {
    let s = s.trim();
    match s.to_ascii_lowercase().as_str() {
      "quick" => Ok(ScanProfile::Quick),
      "deep" => Ok(ScanProfile::Deep),
      "owasp" => Ok(ScanProfile::Owasp),
      lower => match lower.strip_prefix("custom:") {
        Some(list) => Ok(ScanProfile::Custom(
          list
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        )),
        None => Err(Error::invalid(format!("unknown scan profile {:?}", s))),
      },
    }
  }
}

impl fmt::Display for ScanProfile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ScanProfile::Quick => write!(f, "quick"),
      ScanProfile::Deep => write!(f, "deep"),
      ScanProfile::Owasp => write!(f, "owasp"),
      ScanProfile::Custom(names) => write!(f, "custom:{}", names.join(",")),
    }
  }
}

/// `pending → running → {completed, cancelled, failed}`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
  Pending,
  Running,
  Completed,
  Cancelled,
  Failed,
}

impl SessionStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Failed
    )
  }
}

/// A scan against one target scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSession {
  pub id: SessionId,
  pub scope: Url,
  pub profile: ScanProfile,
  pub status: SessionStatus,
  /// 0-100, never decreases.
  pub progress: u8,
  pub started_at: Option<u64>,
  pub ended_at: Option<u64>,
  pub findings_count: usize,
  pub checks_executed: usize,
  pub checks_skipped: usize,
  pub error: Option<String>,
  pub created_at: u64,
}

impl ScanSession {
  pub fn new(scope: Url, profile: ScanProfile) -> Self {
    Self {
      id: SessionId::new(),
      scope,
      profile,
      status: SessionStatus::Pending,
      progress: 0,
      started_at: None,
      ended_at: None,
      findings_count: 0,
      checks_executed: 0,
      checks_skipped: 0,
      error: None,
      created_at: now_millis(),
    }
  }

  /// Move to `next`, rejecting transitions the state machine does not allow.
  pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
    let allowed = matches!(
      (self.status, next),
      (SessionStatus::Pending, SessionStatus::Running)
        | (SessionStatus::Running, SessionStatus::Completed)
        | (SessionStatus::Running, SessionStatus::Cancelled)
        | (SessionStatus::Running, SessionStatus::Failed)
    );
    if !allowed {
      return Err(Error::invalid_state(format!(
        "scan {} cannot go from {:?} to {:?}",
        self.id, self.status, next
      )));
    }
    self.status = next;
    match next {
      SessionStatus::Running => self.started_at = Some(now_millis()),
      SessionStatus::Completed | SessionStatus::Failed => {
        self.progress = 100;
        self.ended_at = Some(now_millis());
      }
      SessionStatus::Cancelled => self.ended_at = Some(now_millis()),
      SessionStatus::Pending => {}
    }
    Ok(())
  }

  /// Raise progress to `executed / scheduled`, held below 100 until a terminal state.
  /// Returns whether the value changed.
  pub fn advance(&mut self, executed: usize, scheduled: usize) -> bool {
    if self.status != SessionStatus::Running || scheduled == 0 {
      return false;
    }
    let pct = ((executed.min(scheduled) * 100) / scheduled).min(99) as u8;
    if pct > self.progress {
      self.progress = pct;
      return true;
    }
    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn session() -> ScanSession {
    ScanSession::new(Url::parse("http://test.local").unwrap(), ScanProfile::Quick)
  }

  #[test]
  fn profiles_parse_from_names() {
    assert_eq!("Quick".parse::<ScanProfile>().unwrap(), ScanProfile::Quick);
    assert_eq!(
      "custom:xss, sql-injection".parse::<ScanProfile>().unwrap(),
      ScanProfile::Custom(vec!["xss".into(), "sql-injection".into()])
    );
    assert!("fast".parse::<ScanProfile>().is_err());
  }

  #[test]
  fn only_legal_transitions_are_accepted() {
    let mut s = session();
    assert!(s.transition(SessionStatus::Cancelled).is_err());
    s.transition(SessionStatus::Running).unwrap();
    s.transition(SessionStatus::Completed).unwrap();
    assert_eq!(s.progress, 100);
    assert!(s.transition(SessionStatus::Running).is_err());
  }

  #[test]
  fn progress_is_monotonic_and_capped() {
    let mut s = session();
    s.transition(SessionStatus::Running).unwrap();
    assert!(s.advance(5, 10));
    assert_eq!(s.progress, 50);
    assert!(!s.advance(3, 10));
    assert_eq!(s.progress, 50);
    s.advance(10, 10);
    assert_eq!(s.progress, 99);
    s.transition(SessionStatus::Cancelled).unwrap();
    assert!(!s.advance(10, 10));
    assert_eq!(s.progress, 99);
  }
}
