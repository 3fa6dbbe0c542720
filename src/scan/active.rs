//! Checks that send mutated probe requests derived from captured messages.
use super::finding::{owasp, Detection, Severity};
use super::signatures;
use crate::message::Message;
use crate::request::{HttpRequest, Url};
use crate::response::HttpResponse;
use http::Method;
use rand::Rng;

/// Parameter added when a base message has no query of its own.
pub const PROBE_PARAM: &str = "vsprobe";

/// One request an active check wants sent.
#[derive(Clone, Debug)]
pub struct Probe {
  pub url: Url,
  pub request: HttpRequest,
  pub parameter: Option<String>,
  pub payload: String,
}

impl Probe {
  /// The base request with `parameter` set to `payload` in the query.
  pub fn mutate(base: &Message, parameter: &str, payload: &str) -> Probe {
    let url = base.url.with_query_param(parameter, payload);
    let mut request = base.request.clone();
    request.retarget(&url);
    Probe {
      url,
      request,
      parameter: Some(parameter.to_string()),
      payload: payload.to_string(),
    }
  }

  /// A fresh `GET` for `path` on the base message's origin.
  pub fn path(base: &Message, path: &str) -> Probe {
    let url = base.url.with_path(path);
    Probe {
      request: HttpRequest::new(Method::GET, &url),
      url,
      parameter: None,
      payload: path.to_string(),
    }
  }
}

pub trait ActiveCheck: Send + Sync {
  fn name(&self) -> &'static str;
  /// Run once per host instead of once per captured message.
  fn per_host(&self) -> bool {
    false
  }
  fn probes(&self, base: &Message) -> Vec<Probe>;
  fn analyze(&self, base: &Message, probe: &Probe, response: &HttpResponse) -> Option<Detection>;
}

/// Every active check shipped with the engine.
pub fn default_checks() -> Vec<Box<dyn ActiveCheck>> {
  vec![
    Box::new(ReflectedInput),
    Box::new(CrossSiteScripting),
    Box::new(SqlInjection),
    Box::new(PathTraversal),
    Box::new(OpenRedirect),
    Box::new(SensitiveFiles),
  ]
}

/// Query parameter names to mutate, falling back to [`PROBE_PARAM`].
fn parameters(base: &Message) -> Vec<String> {
  let mut names: Vec<String> = Vec::new();
  for (name, _) in base.url.query_pairs() {
    if !names.contains(&name) {
      names.push(name);
    }
  }
  if names.is_empty() {
    names.push(PROBE_PARAM.to_string());
  }
  names
}

fn canary() -> String {
  format!("vs{:08x}", rand::thread_rng().gen::<u32>())
}

fn reflected_in(response: &HttpResponse, needle: &str) -> Option<String> {
  if let Some((name, _)) = response.headers.iter().find(|(_, v)| v.contains(needle)) {
    return Some(format!("response header {}", name));
  }
  if response.text().contains(needle) {
    return Some("response body".to_string());
  }
  None
}

pub struct ReflectedInput;

impl ActiveCheck for ReflectedInput {
  fn name(&self) -> &'static str {
    "reflected-input"
  }

  fn probes(&self, base: &Message) -> Vec<Probe> {
    parameters(base)
      .iter()
      .map(|p| Probe::mutate(base, p, &canary()))
      .collect()
  }

  fn analyze(&self, _base: &Message, probe: &Probe, response: &HttpResponse) -> Option<Detection> {
    let location = reflected_in(response, &probe.payload)?;
    let mut detection = Detection::new(self.name(), Severity::Medium, "Reflected input")
      .description("A unique value sent in a parameter came back unencoded in the response.")
      .evidence(format!("canary {} found in {}", probe.payload, location))
      .payload(probe.payload.clone())
      .remediation("Encode user input for the output context before reflecting it.")
      .owasp(owasp::INJECTION)
      .cvss(5.4);
    if let Some(p) = &probe.parameter {
      detection = detection.parameter(p.clone());
    }
    Some(detection)
  }
}

pub struct CrossSiteScripting;

impl ActiveCheck for CrossSiteScripting {
  fn name(&self) -> &'static str {
    "xss"
  }

  fn probes(&self, base: &Message) -> Vec<Probe> {
    parameters(base)
      .iter()
      .map(|p| {
        let marker = canary();
        Probe::mutate(base, p, &format!("<{}>\"'", marker))
      })
      .collect()
  }

  fn analyze(&self, _base: &Message, probe: &Probe, response: &HttpResponse) -> Option<Detection> {
    // markup survives only when the tag and quotes are echoed raw
    if !response.text().contains(&probe.payload) {
      return None;
    }
    let mut detection = Detection::new(self.name(), Severity::High, "Cross-site scripting")
      .description("Injected markup is returned without encoding.")
      .evidence(format!("payload {} echoed verbatim in the response body", probe.payload))
      .payload(probe.payload.clone())
      .remediation("HTML-encode untrusted data and set a restrictive Content-Security-Policy.")
      .owasp(owasp::INJECTION)
      .cvss(7.1);
    if let Some(p) = &probe.parameter {
      detection = detection.parameter(p.clone());
    }
    Some(detection)
  }
}

pub struct SqlInjection;

const SQL_PAYLOADS: &[&str] = &["'", "\"", "1' OR '1'='1"];

impl ActiveCheck for SqlInjection {
  fn name(&self) -> &'static str {
    "sql-injection"
  }

  fn probes(&self, base: &Message) -> Vec<Probe> {
    let mut probes = Vec::new();
    for p in parameters(base) {
      for payload in SQL_PAYLOADS {
        probes.push(Probe::mutate(base, &p, payload));
      }
    }
    probes
  }

  fn analyze(&self, base: &Message, probe: &Probe, response: &HttpResponse) -> Option<Detection> {
    let signature = signatures::find_sql_error(&response.text())?;
    // errors already present without the payload say nothing about it
    let baseline = base.response.as_ref().map(|r| r.text()).unwrap_or_default();
    if signatures::find_sql_error(&baseline).is_some() {
      return None;
    }
    let mut detection = Detection::new(self.name(), Severity::High, "SQL injection")
      .description("A database error appears when the parameter breaks out of its quoting.")
      .evidence(format!("matched {:?}", signature))
      .payload(probe.payload.clone())
      .remediation("Use parameterized queries.")
      .owasp(owasp::INJECTION)
      .cvss(8.6);
    if let Some(p) = &probe.parameter {
      detection = detection.parameter(p.clone());
    }
    Some(detection)
  }
}

pub struct PathTraversal;

const TRAVERSAL_PAYLOADS: &[&str] = &[
  "../../../../../../etc/passwd",
  "..%2f..%2f..%2f..%2f..%2fetc%2fpasswd",
  "..\\..\\..\\..\\..\\windows\\win.ini",
];

impl ActiveCheck for PathTraversal {
  fn name(&self) -> &'static str {
    "path-traversal"
  }

  fn probes(&self, base: &Message) -> Vec<Probe> {
    let mut probes = Vec::new();
    for p in parameters(base) {
      for payload in TRAVERSAL_PAYLOADS {
        probes.push(Probe::mutate(base, &p, payload));
      }
    }
    probes
  }

  fn analyze(&self, base: &Message, probe: &Probe, response: &HttpResponse) -> Option<Detection> {
    let signature = signatures::find_system_file(&response.text())?;
    let baseline = base.response.as_ref().map(|r| r.text()).unwrap_or_default();
    if signatures::find_system_file(&baseline).is_some() {
      return None;
    }
    let mut detection = Detection::new(self.name(), Severity::High, "Path traversal")
      .evidence(format!("system file content {:?} returned", signature))
      .payload(probe.payload.clone())
      .remediation("Resolve requested paths against an allow-listed base directory.")
      .owasp(owasp::BROKEN_ACCESS_CONTROL)
      .cvss(7.5);
    if let Some(p) = &probe.parameter {
      detection = detection.parameter(p.clone());
    }
    Some(detection)
  }
}

pub struct OpenRedirect;

const REDIRECT_TARGET: &str = "https://viperscan.invalid/";

impl ActiveCheck for OpenRedirect {
  fn name(&self) -> &'static str {
    "open-redirect"
  }

  fn probes(&self, base: &Message) -> Vec<Probe> {
    parameters(base)
      .iter()
      .map(|p| Probe::mutate(base, p, REDIRECT_TARGET))
      .collect()
  }

  fn analyze(&self, _base: &Message, probe: &Probe, response: &HttpResponse) -> Option<Detection> {
    if !response.status.is_redirection() {
      return None;
    }
    let location = response.headers.get("location")?;
    if !location.trim().starts_with(REDIRECT_TARGET.trim_end_matches('/')) {
      return None;
    }
    let mut detection = Detection::new(self.name(), Severity::Medium, "Open redirect")
      .evidence(format!("Location: {}", location))
      .payload(probe.payload.clone())
      .remediation("Redirect only to relative paths or an allow-list of hosts.")
      .owasp(owasp::BROKEN_ACCESS_CONTROL)
      .cvss(4.7);
    if let Some(p) = &probe.parameter {
      detection = detection.parameter(p.clone());
    }
    Some(detection)
  }
}

/// Well-known files that should never be served.
pub struct SensitiveFiles;

const SENSITIVE_PATHS: &[(&str, &str)] = &[
  ("/.git/HEAD", "ref: refs/"),
  ("/.env", "="),
  ("/.DS_Store", "Bud1"),
  ("/server-status", "Apache Server Status"),
  ("/phpinfo.php", "phpinfo()"),
  ("/backup.sql", "INSERT INTO"),
];

impl ActiveCheck for SensitiveFiles {
  fn name(&self) -> &'static str {
    "sensitive-files"
  }

  fn per_host(&self) -> bool {
    true
  }

  fn probes(&self, base: &Message) -> Vec<Probe> {
    SENSITIVE_PATHS
      .iter()
      .map(|(path, _)| Probe::path(base, path))
      .collect()
  }

  fn analyze(&self, _base: &Message, probe: &Probe, response: &HttpResponse) -> Option<Detection> {
    if !response.status.is_success() || response.is_synthetic() {
      return None;
    }
    let (path, marker) = SENSITIVE_PATHS.iter().find(|(p, _)| *p == probe.payload)?;
    if !response.text().contains(marker) {
      return None;
    }
    Some(
      Detection::new(self.name(), Severity::Medium, "Sensitive file exposed")
        .evidence(format!("{} returned {}", path, response.status.as_u16()))
        .payload(path.to_string())
        .remediation("Remove the file from the web root or deny access to it.")
        .owasp(owasp::MISCONFIGURATION)
        .cvss(5.3),
    )
  }
}
