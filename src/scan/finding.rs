use crate::ids::{FindingId, MessageId, SessionId};
use crate::message::{now_millis, Message};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity level for security findings, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Info,
  Low,
  Medium,
  High,
  Critical,
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Severity::Info => write!(f, "info"),
      Severity::Low => write!(f, "low"),
      Severity::Medium => write!(f, "medium"),
      Severity::High => write!(f, "high"),
      Severity::Critical => write!(f, "critical"),
    }
  }
}

/// What a check reports before it is attached to a message and session.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
  pub category: &'static str,
  pub severity: Severity,
  pub title: String,
  pub description: String,
  pub evidence: String,
  pub parameter: Option<String>,
  pub payload: Option<String>,
  pub cvss: Option<f32>,
  pub remediation: Option<String>,
  pub owasp: Option<&'static str>,
}

impl Detection {
  pub fn new(category: &'static str, severity: Severity, title: impl Into<String>) -> Self {
    Self {
      category,
      severity,
      title: title.into(),
      description: String::new(),
      evidence: String::new(),
      parameter: None,
      payload: None,
      cvss: None,
      remediation: None,
      owasp: None,
    }
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn evidence(mut self, evidence: impl Into<String>) -> Self {
    self.evidence = evidence.into();
    self
  }

  pub fn parameter(mut self, parameter: impl Into<String>) -> Self {
    self.parameter = Some(parameter.into());
    self
  }

  pub fn payload(mut self, payload: impl Into<String>) -> Self {
    self.payload = Some(payload.into());
    self
  }

  pub fn cvss(mut self, score: f32) -> Self {
    self.cvss = Some(score);
    self
  }

  pub fn remediation(mut self, remediation: impl Into<String>) -> Self {
    self.remediation = Some(remediation.into());
    self
  }

  pub fn owasp(mut self, category: &'static str) -> Self {
    self.owasp = Some(category);
    self
  }
}

/// A recorded finding. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finding {
  pub id: FindingId,
  /// The message the finding was detected on.
  pub message_id: MessageId,
  /// Owning scan session; `None` for findings on live proxy traffic.
  pub session_id: Option<SessionId>,
  pub severity: Severity,
  pub category: String,
  pub title: String,
  pub description: String,
  pub evidence: String,
  pub url: String,
  pub method: String,
  pub parameter: Option<String>,
  pub payload: Option<String>,
  pub cvss: Option<f32>,
  pub remediation: Option<String>,
  pub owasp: Option<String>,
  pub created_at: u64,
}

impl Finding {
  pub fn from_detection(message: &Message, session_id: Option<SessionId>, d: Detection) -> Self {
    Self {
      id: FindingId::new(),
      message_id: message.id,
      session_id,
      severity: d.severity,
      category: d.category.to_string(),
      title: d.title,
      description: d.description,
      evidence: d.evidence,
      url: message.url.to_string(),
      method: message.method().to_string(),
      parameter: d.parameter,
      payload: d.payload,
      cvss: d.cvss,
      remediation: d.remediation,
      owasp: d.owasp.map(|o| o.to_string()),
      created_at: now_millis(),
    }
  }
}

/// OWASP Top 10 (2021) labels used by the shipped checks.
pub mod owasp {
  pub const BROKEN_ACCESS_CONTROL: &str = "A01:2021-Broken Access Control";
  pub const INJECTION: &str = "A03:2021-Injection";
  pub const MISCONFIGURATION: &str = "A05:2021-Security Misconfiguration";
  pub const AUTH_FAILURES: &str = "A07:2021-Identification and Authentication Failures";
}
