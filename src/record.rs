use crate::errors::Result;
use crate::message::Message;
use crate::request::Scheme;
use bytes::Bytes;

/// A shell command that reproduces a captured request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRecord {
  /// nc or curl command
  pub command: String,
}

impl CommandRecord {
  /// `curl` invocation with the method, headers and body of the request.
  pub fn curl(message: &Message) -> Self {
    let request = &message.request;
    let mut curl_cmd = vec!["curl", "-X", request.method.as_str()];
    if message.url.scheme == Scheme::Https {
      curl_cmd.push("-k");
    }
    curl_cmd.push("--compressed\\\r\n");
    let mut command = curl_cmd.join(" ");
    for (k, v) in request.headers.iter() {
      if k.eq_ignore_ascii_case("content-length") {
        continue;
      }
      command.push_str(" -H ");
      command.push_str(&bash_escape(&format!("{}: {}", k, v)));
      command.push_str("\\\r\n");
    }
    if !request.body.is_empty() {
      command.push_str(" --data-binary ");
      command.push_str(&bash_escape(&String::from_utf8_lossy(&request.body)));
      command.push_str("\\\r\n");
    }
    command.push(' ');
    command.push_str(&bash_escape(&message.url.to_string()));
    CommandRecord { command }
  }

  /// Raw request bytes piped into `ncat`, for replays that must stay byte exact.
  pub fn ncat(message: &Message) -> Self {
    let https = message.url.scheme == Scheme::Https;
    let port = message.url.port.to_string();
    let raw = message.request.to_raw();
    let lines = raw
      .split(|b| b == &0xA)
      .map(|line| line.strip_suffix(&[0xD]).unwrap_or(line))
      .map(|line| [line, &[0xD, 0xA]].concat());
    let mut command = String::from("printf");
    command.push(' ');
    for line in lines {
      command.push_str(&bash_escape(&Bytes::from(line).escape_ascii().to_string()));
      command.push_str("\\\r\n");
    }
    command.push('|');
    let mut nc_cmd = vec!["ncat"];
    if https {
      nc_cmd.push("--ssl")
    }
    nc_cmd.push(&message.url.host);
    nc_cmd.push(&port);
    command.push_str(&nc_cmd.join(" "));
    CommandRecord { command }
  }
}

impl From<&Message> for CommandRecord {
  fn from(value: &Message) -> Self {
    CommandRecord::curl(value)
  }
}

/// Pretty JSON of `messages`, in the order given.
pub fn export_json(messages: &[Message]) -> Result<String> {
  Ok(serde_json::to_string_pretty(messages)?)
}

fn bash_escape(s: &str) -> String {
  format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::Source;
  use crate::request::{HttpRequest, Url};
  use http::Method;

  fn message() -> Message {
    let url = Url::parse("https://a.test/login").unwrap();
    let request = HttpRequest::new(Method::POST, &url)
      .header("Content-Type", "application/x-www-form-urlencoded")
      .body("user=o'brien");
    Message::new(url, request, Source::Proxy)
  }

  #[test]
  fn curl_commands_carry_headers_and_body() {
    let command = CommandRecord::curl(&message()).command;
    assert!(command.starts_with("curl -X POST -k --compressed"));
    assert!(command.contains("-H 'Content-Type: application/x-www-form-urlencoded'"));
    assert!(command.contains("--data-binary 'user=o'\\''brien'"));
    assert!(command.ends_with("'https://a.test/login'"));
    assert!(!command.to_ascii_lowercase().contains("content-length"));
  }

  #[test]
  fn ncat_commands_use_ssl_for_https() {
    let command = CommandRecord::ncat(&message()).command;
    assert!(command.starts_with("printf 'POST /login HTTP/1.1"));
    assert!(command.ends_with("|ncat --ssl a.test 443"));
  }

  #[test]
  fn exports_are_json_arrays() {
    let json = export_json(&[message()]).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value.as_array().map(|a| a.len()), Some(1));
  }
}
