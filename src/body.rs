use std::fmt;
use std::ops::Deref;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A message body.
///
/// Serialized as text when it is valid UTF-8 and as base64 otherwise, so exported
/// history stays readable without losing binary payloads.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Body {
  inner: Bytes,
}

impl Body {
  /// Lossy UTF-8 view, used by the signature checks.
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.inner).to_string()
  }

  pub fn bytes(&self) -> Bytes {
    self.inner.clone()
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&str> for Body {
  #[inline]
  fn from(s: &str) -> Body {
    Body {
      inner: Bytes::copy_from_slice(s.as_bytes()),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Debug::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

impl fmt::Display for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(&String::from_utf8_lossy(&self.inner))
  }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
enum EncodedBody {
  Utf8(String),
  Base64(String),
}

impl Serialize for Body {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    let encoded = match std::str::from_utf8(&self.inner) {
      Ok(s) => EncodedBody::Utf8(s.to_string()),
      Err(_) => EncodedBody::Base64(STANDARD.encode(&self.inner)),
    };
    encoded.serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for Body {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    match EncodedBody::deserialize(deserializer)? {
      EncodedBody::Utf8(s) => Ok(Body::from(s)),
      EncodedBody::Base64(s) => STANDARD
        .decode(s)
        .map(Body::from)
        .map_err(serde::de::Error::custom),
    }
  }
}
