//! Payload substitution into marked request templates.
mod payloads;

pub use payloads::{PayloadSource, MAX_PAYLOADS};

use crate::client::Transport;
use crate::errors::{Error, Result};
use crate::events::{Event, EventBus};
use crate::ids::JobId;
use crate::message::now_millis;
use crate::request::{HttpRequest, Url, QUERY_COMPONENT};
use crate::storage::Storage;
use http::Method;
use percent_encoding::utf8_percent_encode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

pub const DEFAULT_MARKER: &str = "§FUZZ§";

/// What to send for every payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FuzzSpec {
  /// Absolute URL containing the marker.
  pub template: String,
  pub marker: String,
  #[serde(with = "http_serde::method")]
  pub method: Method,
  /// Extra headers; markers in values are substituted.
  pub headers: Vec<(String, String)>,
  /// Body template; markers are substituted.
  pub body: Option<String>,
  pub payloads: PayloadSource,
  pub concurrency: usize,
  /// Percent-encode payloads placed in the URL.
  pub url_encode: bool,
  /// Status codes left out of the results.
  pub hide_status: Vec<u16>,
}

impl FuzzSpec {
  pub fn new(template: impl Into<String>, payloads: PayloadSource) -> Self {
    Self {
      template: template.into(),
      marker: DEFAULT_MARKER.to_string(),
      method: Method::GET,
      headers: Vec::new(),
      body: None,
      payloads,
      concurrency: 10,
      url_encode: true,
      hide_status: Vec::new(),
    }
  }

  pub fn concurrency(mut self, workers: usize) -> Self {
    self.concurrency = workers;
    self
  }

  pub fn method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn marker(mut self, marker: impl Into<String>) -> Self {
    self.marker = marker.into();
    self
  }

  pub fn url_encode(mut self, value: bool) -> Self {
    self.url_encode = value;
    self
  }

  pub fn hide_status(mut self, codes: Vec<u16>) -> Self {
    self.hide_status = codes;
    self
  }

  fn validate(&self) -> Result<()> {
    if self.marker.is_empty() {
      return Err(Error::invalid("empty fuzz marker"));
    }
    let marked = self.template.contains(&self.marker)
      || self.body.as_deref().is_some_and(|b| b.contains(&self.marker))
      || self.headers.iter().any(|(_, v)| v.contains(&self.marker));
    if !marked {
      return Err(Error::invalid(format!(
        "template has no {} marker",
        self.marker
      )));
    }
    Url::parse(&self.template.replace(&self.marker, "x")).map(|_| ())
  }

  /// The concrete request for one payload.
  fn render(&self, payload: &str) -> Result<(Url, HttpRequest)> {
    let in_url = if self.url_encode {
      utf8_percent_encode(payload, QUERY_COMPONENT).to_string()
    } else {
      payload.to_string()
    };
    let url = Url::parse(&self.template.replace(&self.marker, &in_url))?;
    let mut request = HttpRequest::new(self.method.clone(), &url);
    for (name, value) in &self.headers {
      request.headers.append(name.clone(), value.replace(&self.marker, payload));
    }
    if let Some(body) = &self.body {
      request = request.body(body.replace(&self.marker, payload));
    }
    Ok((url, request))
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuzzStatus {
  Running,
  Completed,
  Stopped,
}

/// One payload's outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzResult {
  /// Position of the payload in the job's sequence.
  pub index: usize,
  pub payload: String,
  pub url: String,
  pub status: Option<u16>,
  pub length: usize,
  pub latency_ms: u64,
  pub content_type: Option<String>,
  pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzJob {
  pub id: JobId,
  pub template: String,
  pub concurrency: usize,
  pub total: usize,
  /// Payloads sent so far, hidden results included.
  pub completed: usize,
  pub status: FuzzStatus,
  pub started_at: u64,
  pub ended_at: Option<u64>,
}

struct JobHandle {
  job: Mutex<FuzzJob>,
  stop: watch::Sender<bool>,
}

impl JobHandle {
  fn lock(&self) -> std::sync::MutexGuard<'_, FuzzJob> {
    self.job.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Runs fuzz jobs, each with its own bounded worker pool.
pub struct Fuzzer {
  transport: Arc<dyn Transport>,
  storage: Arc<dyn Storage>,
  events: EventBus,
  jobs: RwLock<HashMap<JobId, Arc<JobHandle>>>,
}

impl Fuzzer {
  pub fn new(transport: Arc<dyn Transport>, storage: Arc<dyn Storage>, events: EventBus) -> Self {
    Self {
      transport,
      storage,
      events,
      jobs: RwLock::new(HashMap::new()),
    }
  }

  fn handle(&self, id: JobId) -> Result<Arc<JobHandle>> {
    self
      .jobs
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&id)
      .cloned()
      .ok_or_else(|| Error::not_found(format!("fuzz job {}", id)))
  }

  pub async fn start_fuzz(self: &Arc<Self>, spec: FuzzSpec) -> Result<JobId> {
    spec.validate()?;
    let payloads = spec.payloads.generate()?;
    let concurrency = spec.concurrency.max(1);
    let job = FuzzJob {
      id: JobId::new(),
      template: spec.template.clone(),
      concurrency,
      total: payloads.len(),
      completed: 0,
      status: FuzzStatus::Running,
      started_at: now_millis(),
      ended_at: None,
    };
    let id = job.id;
    let (stop, _) = watch::channel(false);
    let handle = Arc::new(JobHandle {
      job: Mutex::new(job),
      stop,
    });
    self
      .jobs
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id, handle.clone());
    tracing::info!(job = %id, template = %spec.template, payloads = payloads.len(), concurrency, "fuzz job started");
    let fuzzer = self.clone();
    tokio::spawn(async move {
      fuzzer.run(id, handle, Arc::new(spec), payloads, concurrency).await;
    });
    Ok(id)
  }

  /// Fuzz `base_url/§FUZZ§` with every word, bare and with each extension.
  /// 404 responses are not recorded.
  pub async fn start_discovery(
    self: &Arc<Self>,
    base_url: &str,
    words: &[String],
    extensions: &[String],
    concurrency: usize,
  ) -> Result<JobId> {
    let mut payloads = Vec::new();
    for word in words.iter().map(|w| w.trim().trim_start_matches('/')) {
      if word.is_empty() {
        continue;
      }
      payloads.push(word.to_string());
      for ext in extensions {
        let ext = ext.trim().trim_start_matches('.');
        if !ext.is_empty() {
          payloads.push(format!("{}.{}", word, ext));
        }
      }
    }
    let template = format!("{}/{}", base_url.trim_end_matches('/'), DEFAULT_MARKER);
    let spec = FuzzSpec::new(template, PayloadSource::List { items: payloads })
      .concurrency(concurrency)
      .url_encode(false)
      .hide_status(vec![404]);
    self.start_fuzz(spec).await
  }

  /// Halt dispatch of the remaining payloads. Requests already sent complete.
  pub fn stop_fuzz(&self, id: JobId) -> Result<()> {
    let handle = self.handle(id)?;
    {
      let mut job = handle.lock();
      if job.status != FuzzStatus::Running {
        return Err(Error::invalid_state(format!(
          "fuzz job {} is already {:?}",
          id, job.status
        )));
      }
      job.status = FuzzStatus::Stopped;
      job.ended_at = Some(now_millis());
    }
    handle.stop.send_replace(true);
    tracing::info!(job = %id, "fuzz job stopped");
    self.events.publish(Event::FuzzCompleted {
      job_id: id,
      status: FuzzStatus::Stopped,
    });
    Ok(())
  }

  pub fn get_fuzz_job(&self, id: JobId) -> Result<FuzzJob> {
    Ok(self.handle(id)?.lock().clone())
  }

  /// Recorded results in payload order.
  pub async fn get_fuzz_results(&self, id: JobId) -> Result<Vec<FuzzResult>> {
    self.handle(id)?;
    let mut results = self.storage.fuzz_results(id).await?;
    results.sort_by_key(|r| r.index);
    Ok(results)
  }

  async fn run(
    self: Arc<Self>,
    id: JobId,
    handle: Arc<JobHandle>,
    spec: Arc<FuzzSpec>,
    payloads: Vec<String>,
    concurrency: usize,
  ) {
    let workers = Arc::new(Semaphore::new(concurrency));
    let mut stopped = handle.stop.subscribe();
    let mut in_flight = JoinSet::new();
    for (index, payload) in payloads.into_iter().enumerate() {
      let stop = *stopped.borrow();
      if stop {
        break;
      }
      let permit = tokio::select! {
        permit = workers.clone().acquire_owned() => match permit {
          Ok(p) => p,
          Err(_) => break,
        },
        _ = stopped.changed() => break,
      };
      let fuzzer = self.clone();
      let handle = handle.clone();
      let spec = spec.clone();
      in_flight.spawn(async move {
        let _permit = permit;
        let result = fuzzer.attempt(&spec, index, payload).await;
        handle.lock().completed += 1;
        if result.status.is_some_and(|s| spec.hide_status.contains(&s)) {
          return;
        }
        if let Err(e) = fuzzer.storage.append_fuzz_result(id, result.clone()).await {
          tracing::warn!(job = %id, error = %e, "failed to store fuzz result");
          return;
        }
        fuzzer.events.publish(Event::FuzzResult { job_id: id, result });
      });
    }
    while in_flight.join_next().await.is_some() {}

    let finished = {
      let mut job = handle.lock();
      if job.status == FuzzStatus::Running {
        job.status = FuzzStatus::Completed;
        job.ended_at = Some(now_millis());
        Some(job.completed)
      } else {
        None
      }
    };
    if let Some(completed) = finished {
      tracing::info!(job = %id, completed, "fuzz job completed");
      self.events.publish(Event::FuzzCompleted {
        job_id: id,
        status: FuzzStatus::Completed,
      });
    }
  }

  async fn attempt(&self, spec: &FuzzSpec, index: usize, payload: String) -> FuzzResult {
    let mut result = FuzzResult {
      index,
      url: spec.template.replace(&spec.marker, &payload),
      payload,
      status: None,
      length: 0,
      latency_ms: 0,
      content_type: None,
      error: None,
    };
    let (url, request) = match spec.render(&result.payload) {
      Ok(rendered) => rendered,
      Err(e) => {
        result.error = Some(e.to_string());
        return result;
      }
    };
    result.url = url.to_string();
    let started = Instant::now();
    let sent = self.transport.send(&url, &request).await;
    result.latency_ms = started.elapsed().as_millis() as u64;
    match sent {
      Ok(response) => {
        result.status = Some(response.status.as_u16());
        result.length = response.body.len();
        result.content_type = response.content_type().map(String::from);
      }
      Err(e) => result.error = Some(e.to_string()),
    }
    tracing::trace!(index, url = %result.url, status = ?result.status, "fuzz payload sent");
    result
  }
}
