//! Scan sessions driven through the proxy facade

mod common;

use std::sync::Arc;
use viperscan::{
  Error, Event, HttpRequest, HttpResponse, MessageFilter, ScanProfile, SessionId, SessionStatus,
  Severity, Source, StatusCode, Subscription,
};

/// Collect progress values for `session` until it finishes.
async fn until_finished(events: &mut Subscription, session: SessionId) -> (Vec<u8>, SessionStatus) {
  let mut progress = Vec::new();
  let wait = async {
    while let Some(event) = events.recv().await {
      match event {
        Event::ScanProgress {
          session_id,
          progress: p,
          ..
        } if session_id == session => progress.push(p),
        Event::ScanCompleted { session_id, status, .. } if session_id == session => return status,
        _ => {}
      }
    }
    panic!("event bus closed");
  };
  let status = tokio::time::timeout(std::time::Duration::from_secs(10), wait)
    .await
    .expect("scan did not finish");
  (progress, status)
}

#[tokio::test]
async fn test_quick_scan_reports_reflected_input() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, _) = common::proxy("scan-quick", upstream.addr, |_| {}).await;
  let mut events = proxy.subscribe();

  let id = proxy
    .start_scan("http://test.local/search?q=x", ScanProfile::Quick)
    .await
    .unwrap();
  let (progress, status) = until_finished(&mut events, id).await;
  assert_eq!(status, SessionStatus::Completed);
  assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", progress);
  assert_eq!(progress.last(), Some(&100));

  let findings = proxy.list_findings(Some(id)).await.unwrap();
  let serious: Vec<_> = findings.iter().filter(|f| f.severity >= Severity::Medium).collect();
  assert_eq!(serious.len(), 1, "{:?}", findings);
  assert_eq!(serious[0].category, "reflected-input");
  assert_eq!(serious[0].session_id, Some(id));
  assert_eq!(serious[0].parameter.as_deref(), Some("q"));

  let session = proxy.get_session(id).await.unwrap();
  assert_eq!(session.status, SessionStatus::Completed);
  assert_eq!(session.progress, 100);
  assert_eq!(session.findings_count, findings.len());
  assert!(session.checks_executed > 0);
  assert!(session.ended_at.is_some());
  assert_eq!(proxy.list_sessions().await.unwrap().len(), 1);

  // the seed is recorded, probes are not
  let scanner = proxy
    .list_messages(&MessageFilter::default().source(Source::Scanner))
    .await
    .unwrap();
  assert_eq!(scanner.len(), 1);
  assert!(upstream.requests().len() > 1);

  common::cleanup("scan-quick");
}

fn vulnerable() -> common::Handler {
  Arc::new(|request: &HttpRequest| {
    if request.target.starts_with("/.git/HEAD") {
      return HttpResponse::with_body(StatusCode::OK, "text/plain", "ref: refs/heads/main\n");
    }
    let query = request.target.split_once('?').map(|(_, q)| q).unwrap_or("");
    if query.contains('\'') || query.contains("%27") {
      return HttpResponse::with_body(
        StatusCode::INTERNAL_SERVER_ERROR,
        "text/html",
        "You have an error in your SQL syntax near ''' at line 1",
      );
    }
    if request.target.starts_with("/item") {
      return HttpResponse::with_body(StatusCode::OK, "text/plain", "item page");
    }
    HttpResponse::with_body(StatusCode::NOT_FOUND, "text/plain", "nope")
  })
}

#[tokio::test]
async fn test_deep_scan_finds_injection_and_exposed_files() {
  let upstream = common::upstream(vulnerable()).await;
  let (proxy, _) = common::proxy("scan-deep", upstream.addr, |_| {}).await;
  let mut events = proxy.subscribe();

  let id = proxy
    .start_scan("http://test.local/item?id=7", ScanProfile::Deep)
    .await
    .unwrap();
  let (_, status) = until_finished(&mut events, id).await;
  assert_eq!(status, SessionStatus::Completed);

  let findings = proxy.list_findings(Some(id)).await.unwrap();
  let categories: Vec<&str> = findings.iter().map(|f| f.category.as_str()).collect();
  assert!(categories.contains(&"sql-injection"), "{:?}", categories);
  assert!(categories.contains(&"sensitive-files"), "{:?}", categories);
  let sqli = findings.iter().filter(|f| f.category == "sql-injection").count();
  assert_eq!(sqli, 1, "one finding per category and message");
  let high = findings.iter().find(|f| f.category == "sql-injection").unwrap();
  assert_eq!(high.severity, Severity::High);
  assert!(high.owasp.is_some());

  common::cleanup("scan-deep");
}

#[tokio::test]
async fn test_unreachable_targets_fail_the_session() {
  let closed = common::closed_port().await;
  let (proxy, _) = common::proxy("scan-fail", closed, |_| {}).await;
  let mut events = proxy.subscribe();

  let id = proxy.start_scan("http://test.local/", ScanProfile::Quick).await.unwrap();
  let (_, status) = until_finished(&mut events, id).await;
  assert_eq!(status, SessionStatus::Failed);
  let session = proxy.get_session(id).await.unwrap();
  assert!(session.error.is_some());
  assert!(proxy.list_findings(Some(id)).await.unwrap().is_empty());

  common::cleanup("scan-fail");
}

#[tokio::test]
async fn test_cancelled_sessions_stay_cancelled() {
  let (silent, _) = common::silent_upstream().await;
  let (proxy, _) = common::proxy("scan-cancel", silent, |config| {
    config.read_timeout_secs = 1;
  })
  .await;
  let mut events = proxy.subscribe();

  let id = proxy.start_scan("http://test.local/?a=1", ScanProfile::Deep).await.unwrap();
  proxy.cancel_scan(id).await.unwrap();
  let (_, status) = until_finished(&mut events, id).await;
  assert_eq!(status, SessionStatus::Cancelled);

  assert!(matches!(proxy.cancel_scan(id).await, Err(Error::InvalidState(_))));
  assert!(matches!(
    proxy.cancel_scan(SessionId::new()).await,
    Err(Error::NotFound(_))
  ));

  // the late seed failure must not overwrite the cancellation
  tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
  let session = proxy.get_session(id).await.unwrap();
  assert_eq!(session.status, SessionStatus::Cancelled);

  common::cleanup("scan-cancel");
}

#[tokio::test]
async fn test_proxied_traffic_is_passively_analyzed() {
  let upstream = common::upstream(Arc::new(|_: &HttpRequest| {
    HttpResponse::with_body(StatusCode::OK, "text/plain", "hi")
      .header("Set-Cookie", "session=abc; Path=/")
      .header("Server", "nginx/1.18.0")
  }))
  .await;
  let (proxy, addr) = common::proxy("scan-passive", upstream.addr, |_| {}).await;

  let raw = "GET http://test.local/account HTTP/1.1\r\nHost: test.local\r\n\r\n";
  common::fetch(addr, raw).await.unwrap();
  common::fetch(addr, raw).await.unwrap();

  let findings = proxy.list_findings(None).await.unwrap();
  let cookie: Vec<_> = findings.iter().filter(|f| f.category == "insecure-cookie").collect();
  // two distinct messages, one finding each
  assert_eq!(cookie.len(), 2, "{:?}", findings);
  assert!(cookie.iter().all(|f| f.session_id.is_none()));
  assert!(findings
    .iter()
    .any(|f| f.category == "version-disclosure" && f.severity == Severity::Info));

  common::cleanup("scan-passive");
}

#[tokio::test]
async fn test_unknown_custom_checks_are_rejected_up_front() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, _) = common::proxy("scan-custom", upstream.addr, |_| {}).await;
  let profile = ScanProfile::Custom(vec!["xss".to_string(), "telepathy".to_string()]);
  assert!(matches!(
    proxy.start_scan("http://test.local/", profile).await,
    Err(Error::Invalid(_))
  ));
  assert!(proxy.list_sessions().await.unwrap().is_empty());
  common::cleanup("scan-custom");
}
