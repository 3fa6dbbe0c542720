//! Identifier newtypes for messages, findings, scan sessions and fuzz jobs.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! id_type {
  ($(#[$doc:meta])* $name:ident) => {
    $(#[$doc])*
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct $name(Uuid);

    impl $name {
      pub fn new() -> Self {
        Self(Uuid::new_v4())
      }
    }

    impl Default for $name {
      fn default() -> Self {
        Self::new()
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
      }
    }

    impl FromStr for $name {
      type Err = crate::errors::Error;

      fn from_str(s: &str) -> crate::errors::Result<Self> {
        Uuid::parse_str(s)
          .map(Self)
          .map_err(|e| crate::errors::Error::invalid(format!("invalid id {:?}: {}", s, e)))
      }
    }
  };
}

id_type!(
  /// Identifies a captured message.
  MessageId
);
id_type!(
  /// Identifies a finding.
  FindingId
);
id_type!(
  /// Identifies a scan session.
  SessionId
);
id_type!(
  /// Identifies a fuzz or discovery job.
  JobId
);
