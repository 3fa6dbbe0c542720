//! Ordered, case-insensitive header collection.
//!
//! Names are unique ignoring case and keep the spelling of their first
//! occurrence; a repeated header adds a value to the existing entry. Encoding
//! emits one line per value.
use serde::{Deserialize, Serialize};

/// Hop-by-hop headers that never cross the proxy.
pub const HOP_BY_HOP: &[&str] = &[
  "connection",
  "proxy-connection",
  "keep-alive",
  "te",
  "trailer",
  "upgrade",
  "proxy-authorization",
  "proxy-authenticate",
];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
  name: String,
  values: Vec<String>,
}

/// Header mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
  entries: Vec<Entry>,
}

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  fn position(&self, name: &str) -> Option<usize> {
    self
      .entries
      .iter()
      .position(|e| e.name.eq_ignore_ascii_case(name))
  }

  /// First value of `name`.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .position(name)
      .and_then(|i| self.entries[i].values.first())
      .map(|v| v.as_str())
  }

  /// Every value of `name`, in arrival order.
  pub fn get_all(&self, name: &str) -> &[String] {
    match self.position(name) {
      Some(i) => &self.entries[i].values,
      None => &[],
    }
  }

  pub fn contains(&self, name: &str) -> bool {
    self.position(name).is_some()
  }

  /// Replace all values of `name`. An existing entry keeps its position and spelling.
  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    match self.position(&name) {
      Some(i) => self.entries[i].values = vec![value.into()],
      None => self.entries.push(Entry {
        name,
        values: vec![value.into()],
      }),
    }
  }

  /// Add a value to `name`, creating the entry when missing.
  pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    match self.position(&name) {
      Some(i) => self.entries[i].values.push(value.into()),
      None => self.entries.push(Entry {
        name,
        values: vec![value.into()],
      }),
    }
  }

  pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
    self
      .position(name)
      .map(|i| self.entries.remove(i).values)
  }

  /// Number of distinct names.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Header lines in encoding order: `(name, value)` for every value.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .entries
      .iter()
      .flat_map(|e| e.values.iter().map(move |v| (e.name.as_str(), v.as_str())))
  }

  /// Distinct header names.
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.entries.iter().map(|e| e.name.as_str())
  }

  pub fn content_length(&self) -> Option<usize> {
    self.get("content-length").and_then(|v| v.trim().parse().ok())
  }

  pub fn is_chunked(&self) -> bool {
    self.get_all("transfer-encoding").iter().any(|v| {
      v.split(',')
        .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
    })
  }

  /// Whether any `Connection` value lists `token`.
  pub fn has_connection_token(&self, token: &str) -> bool {
    self.get_all("connection").iter().any(|v| {
      v.split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
    })
  }

  /// Drop hop-by-hop headers, including any named by `Connection`.
  pub fn strip_hop_by_hop(&mut self) {
    let listed: Vec<String> = self
      .get_all("connection")
      .iter()
      .flat_map(|v| v.split(',').map(|t| t.trim().to_string()))
      .filter(|t| !t.is_empty())
      .collect();
    for name in listed {
      self.remove(&name);
    }
    self
      .entries
      .retain(|e| !HOP_BY_HOP.iter().any(|h| e.name.eq_ignore_ascii_case(h)));
  }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
  fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
    let mut headers = Headers::new();
    for (n, v) in iter {
      headers.append(n, v);
    }
    headers
  }
}
