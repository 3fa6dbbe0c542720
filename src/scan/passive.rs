//! Checks that analyze captured traffic without sending anything.
use super::finding::{owasp, Detection, Severity};
use super::signatures;
use crate::errors::Result;
use crate::message::Message;
use crate::request::Scheme;

/// Pure analysis of one captured exchange.
pub trait PassiveCheck: Send + Sync {
  fn name(&self) -> &'static str;
  /// At most one detection per message.
  fn check(&self, message: &Message) -> Result<Option<Detection>>;
}

/// Every passive check shipped with the engine.
pub fn default_checks() -> Vec<Box<dyn PassiveCheck>> {
  vec![
    Box::new(MissingSecurityHeaders),
    Box::new(ReflectedInput),
    Box::new(InsecureCookie),
    Box::new(VersionDisclosure),
    Box::new(ErrorDisclosure),
    Box::new(CorsMisconfiguration),
    Box::new(DirectoryListing),
  ]
}

fn is_html(message: &Message) -> bool {
  message
    .response
    .as_ref()
    .and_then(|r| r.content_type())
    .map(|ct| ct.to_ascii_lowercase().contains("html"))
    .unwrap_or(false)
}

pub struct MissingSecurityHeaders;

impl PassiveCheck for MissingSecurityHeaders {
  fn name(&self) -> &'static str {
    "missing-security-headers"
  }

  fn check(&self, message: &Message) -> Result<Option<Detection>> {
    let response = match &message.response {
      Some(r) if r.status.is_success() && !r.is_synthetic() && is_html(message) => r,
      _ => return Ok(None),
    };
    let mut expected = vec![
      "content-security-policy",
      "x-frame-options",
      "x-content-type-options",
    ];
    if message.url.scheme == Scheme::Https {
      expected.push("strict-transport-security");
    }
    let missing: Vec<&str> = expected
      .into_iter()
      .filter(|h| !response.headers.contains(h))
      .collect();
    if missing.is_empty() {
      return Ok(None);
    }
    Ok(Some(
      Detection::new(self.name(), Severity::Low, "Missing security headers")
        .description("The HTML response does not set standard browser hardening headers.")
        .evidence(format!("missing: {}", missing.join(", ")))
        .remediation("Send Content-Security-Policy, X-Frame-Options, X-Content-Type-Options and, over HTTPS, Strict-Transport-Security.")
        .owasp(owasp::MISCONFIGURATION)
        .cvss(3.1),
    ))
  }
}

/// A query value echoed verbatim in the response.
pub struct ReflectedInput;

impl PassiveCheck for ReflectedInput {
  fn name(&self) -> &'static str {
    "reflected-input"
  }

  fn check(&self, message: &Message) -> Result<Option<Detection>> {
    let response = match &message.response {
      Some(r) if !r.is_synthetic() => r,
      _ => return Ok(None),
    };
    let body = response.text();
    for (name, value) in message.url.query_pairs() {
      // short values match by accident
      if value.len() < 4 {
        continue;
      }
      let in_header = response
        .headers
        .iter()
        .find(|(_, v)| v.contains(value.as_str()))
        .map(|(k, _)| k.to_string());
      let location = match in_header {
        Some(h) => format!("response header {}", h),
        None if body.contains(value.as_str()) => "response body".to_string(),
        None => continue,
      };
      return Ok(Some(
        Detection::new(self.name(), Severity::Medium, "Reflected input")
          .description("A request parameter is echoed back unencoded in the response.")
          .evidence(format!("value of {:?} reflected in {}", name, location))
          .parameter(name)
          .remediation("Encode user input for the output context before reflecting it.")
          .owasp(owasp::INJECTION)
          .cvss(5.4),
      ));
    }
    Ok(None)
  }
}

pub struct InsecureCookie;

impl PassiveCheck for InsecureCookie {
  fn name(&self) -> &'static str {
    "insecure-cookie"
  }

  fn check(&self, message: &Message) -> Result<Option<Detection>> {
    let response = match &message.response {
      Some(r) => r,
      None => return Ok(None),
    };
    for cookie in response.headers.get_all("set-cookie") {
      let attributes: Vec<String> = cookie
        .split(';')
        .skip(1)
        .map(|a| a.trim().to_ascii_lowercase())
        .collect();
      let has = |name: &str| {
        attributes
          .iter()
          .any(|a| a == name || a.starts_with(&format!("{}=", name)))
      };
      let mut missing = Vec::new();
      if !has("httponly") {
        missing.push("HttpOnly");
      }
      if message.url.scheme == Scheme::Https && !has("secure") {
        missing.push("Secure");
      }
      if missing.is_empty() {
        continue;
      }
      let name = cookie.split('=').next().unwrap_or_default().trim();
      return Ok(Some(
        Detection::new(self.name(), Severity::Low, "Cookie without security flags")
          .evidence(format!("cookie {:?} lacks {}", name, missing.join(" and ")))
          .parameter(name)
          .remediation("Set HttpOnly and Secure on session cookies.")
          .owasp(owasp::AUTH_FAILURES)
          .cvss(3.7),
      ));
    }
    Ok(None)
  }
}

/// Server software and version advertised in headers.
pub struct VersionDisclosure;

impl PassiveCheck for VersionDisclosure {
  fn name(&self) -> &'static str {
    "version-disclosure"
  }

  fn check(&self, message: &Message) -> Result<Option<Detection>> {
    let response = match &message.response {
      Some(r) if !r.is_synthetic() => r,
      _ => return Ok(None),
    };
    for header in ["server", "x-powered-by", "x-aspnet-version", "x-aspnetmvc-version"] {
      if let Some(value) = response.headers.get(header) {
        if value.chars().any(|c| c.is_ascii_digit()) {
          return Ok(Some(
            Detection::new(self.name(), Severity::Info, "Software version disclosed")
              .evidence(format!("{}: {}", header, value))
              .remediation("Remove version details from response headers.")
              .owasp(owasp::MISCONFIGURATION),
          ));
        }
      }
    }
    Ok(None)
  }
}

/// Stack traces and database errors in response bodies.
pub struct ErrorDisclosure;

impl PassiveCheck for ErrorDisclosure {
  fn name(&self) -> &'static str {
    "error-disclosure"
  }

  fn check(&self, message: &Message) -> Result<Option<Detection>> {
    let response = match &message.response {
      Some(r) if !r.is_synthetic() => r,
      _ => return Ok(None),
    };
    let body = response.text();
    let hit = signatures::find_sql_error(&body).or_else(|| signatures::find_stack_trace(&body));
    Ok(hit.map(|signature| {
      Detection::new(self.name(), Severity::Medium, "Error details disclosed")
        .description("The response contains internal error output.")
        .evidence(format!("matched {:?}", signature))
        .remediation("Return generic error pages and log details server side.")
        .owasp(owasp::MISCONFIGURATION)
        .cvss(5.3)
    }))
  }
}

pub struct CorsMisconfiguration;

impl PassiveCheck for CorsMisconfiguration {
  fn name(&self) -> &'static str {
    "cors-misconfiguration"
  }

  fn check(&self, message: &Message) -> Result<Option<Detection>> {
    let response = match &message.response {
      Some(r) => r,
      None => return Ok(None),
    };
    let allow_origin = match response.headers.get("access-control-allow-origin") {
      Some(v) => v.trim(),
      None => return Ok(None),
    };
    let credentials = response
      .headers
      .get("access-control-allow-credentials")
      .map(|v| v.trim().eq_ignore_ascii_case("true"))
      .unwrap_or(false);
    let reflected_origin = message
      .request
      .headers
      .get("origin")
      .map(|o| o.trim() == allow_origin)
      .unwrap_or(false);
    let severity = match (allow_origin, credentials, reflected_origin) {
      (_, true, true) => Severity::High,
      ("*", true, _) | ("null", true, _) => Severity::Medium,
      _ => return Ok(None),
    };
    Ok(Some(
      Detection::new(self.name(), severity, "Permissive CORS policy with credentials")
        .evidence(format!(
          "Access-Control-Allow-Origin: {}, Access-Control-Allow-Credentials: true",
          allow_origin
        ))
        .remediation("Allow credentials only for an explicit list of trusted origins.")
        .owasp(owasp::BROKEN_ACCESS_CONTROL)
        .cvss(6.5),
    ))
  }
}

pub struct DirectoryListing;

impl PassiveCheck for DirectoryListing {
  fn name(&self) -> &'static str {
    "directory-listing"
  }

  fn check(&self, message: &Message) -> Result<Option<Detection>> {
    if !is_html(message) {
      return Ok(None);
    }
    let body = match &message.response {
      Some(r) => r.text(),
      None => return Ok(None),
    };
    let signature = ["<title>Index of /", "<h1>Index of /", "Directory listing for /"]
      .into_iter()
      .find(|s| body.contains(s));
    Ok(signature.map(|s| {
      Detection::new(self.name(), Severity::Low, "Directory listing enabled")
        .evidence(format!("matched {:?}", s))
        .remediation("Disable automatic directory indexes.")
        .owasp(owasp::MISCONFIGURATION)
        .cvss(4.3)
    }))
  }
}
