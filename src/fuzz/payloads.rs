use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};

/// Largest payload set a single job may expand to.
pub const MAX_PAYLOADS: usize = 100_000;

/// Where a job's payloads come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PayloadSource {
  /// Explicit payloads, used as given.
  List { items: Vec<String> },
  /// Newline separated words; blank lines are skipped.
  Wordlist { text: String },
  /// `from..=to` by `step`.
  Numbers { from: i64, to: i64, step: i64 },
  /// Every string over `charset` with a length in `min_len..=max_len`.
  Brute {
    charset: String,
    min_len: usize,
    max_len: usize,
  },
}

impl PayloadSource {
  pub fn list<I, S>(items: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    PayloadSource::List {
      items: items.into_iter().map(Into::into).collect(),
    }
  }

  /// Expand into the ordered payload sequence.
  pub fn generate(&self) -> Result<Vec<String>> {
    let payloads = match self {
      PayloadSource::List { items } => items.clone(),
      PayloadSource::Wordlist { text } => text
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect(),
      PayloadSource::Numbers { from, to, step } => numbers(*from, *to, *step)?,
      PayloadSource::Brute {
        charset,
        min_len,
        max_len,
      } => brute(charset, *min_len, *max_len)?,
    };
    if payloads.len() > MAX_PAYLOADS {
      return Err(Error::invalid(format!(
        "{} payloads exceed the limit of {}",
        payloads.len(),
        MAX_PAYLOADS
      )));
    }
    Ok(payloads)
  }
}

fn numbers(from: i64, to: i64, step: i64) -> Result<Vec<String>> {
  if step == 0 || (to > from && step < 0) || (to < from && step > 0) {
    return Err(Error::invalid(format!(
      "step {} never reaches {} from {}",
      step, to, from
    )));
  }
  let count = (to.abs_diff(from) / step.unsigned_abs()) as usize + 1;
  if count > MAX_PAYLOADS {
    return Err(Error::invalid(format!("range yields {} payloads", count)));
  }
  Ok(
    (0..count as i64)
      .map(|i| (from + i * step).to_string())
      .collect(),
  )
}

fn brute(charset: &str, min_len: usize, max_len: usize) -> Result<Vec<String>> {
  let chars: Vec<char> = charset.chars().collect();
  if chars.is_empty() || min_len > max_len {
    return Err(Error::invalid("brute force needs a charset and min_len <= max_len"));
  }
  let mut total: usize = 0;
  for len in min_len..=max_len {
    let n = chars
      .len()
      .checked_pow(len as u32)
      .ok_or_else(|| Error::invalid("brute force space too large"))?;
    total = total.saturating_add(n);
    if total > MAX_PAYLOADS {
      return Err(Error::invalid(format!(
        "brute force space exceeds {} payloads",
        MAX_PAYLOADS
      )));
    }
  }
  let mut out = Vec::with_capacity(total);
  for len in min_len..=max_len {
    let mut digits = vec![0usize; len];
    'odometer: loop {
      out.push(digits.iter().map(|&d| chars[d]).collect());
      // rightmost digit turns fastest
      let mut pos = len;
      loop {
        if pos == 0 {
          break 'odometer;
        }
        pos -= 1;
        digits[pos] += 1;
        if digits[pos] < chars.len() {
          break;
        }
        digits[pos] = 0;
      }
    }
  }
  Ok(out)
}
