//! Replaying captured messages with edits

mod common;

use viperscan::{
  Error, Event, Marker, MessageEdits, MessageFilter, MessageId, Method, Source, StatusCode,
  UpstreamFailure,
};

#[tokio::test]
async fn test_replays_are_new_messages_with_the_edits_applied() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("replay", upstream.addr, |_| {}).await;
  common::fetch(
    addr,
    "GET http://test.local/api?id=1 HTTP/1.1\r\nHost: test.local\r\nCookie: sid=1\r\n\r\n",
  )
  .await
  .unwrap();
  let original = proxy.list_messages(&MessageFilter::default()).await.unwrap().remove(0);
  let mut events = proxy.subscribe();

  let edits = MessageEdits::default()
    .method(Method::PUT)
    .url("http://test.local/api?id=2")
    .set_header("X-Replay", "1")
    .remove_header("cookie")
    .body("{\"a\":1}");
  let replayed = proxy.replay(original.id, &edits).await.unwrap();

  assert_ne!(replayed.id, original.id);
  assert_eq!(replayed.source, Source::Repeater);
  assert_eq!(replayed.marker, Marker::Completed);
  assert_eq!(replayed.status(), Some(200));
  let echoed = replayed.response.as_ref().unwrap().headers.get("x-echo");
  assert_eq!(echoed, Some("id=2"));

  let sent = upstream.requests().pop().unwrap();
  assert_eq!(sent.method, Method::PUT);
  assert_eq!(sent.target, "/api?id=2");
  assert_eq!(sent.headers.get("x-replay"), Some("1"));
  assert!(!sent.headers.contains("cookie"));
  assert_eq!(sent.body.text(), "{\"a\":1}");

  // the original is untouched and both are in history
  let stored = proxy.get_message(original.id).await.unwrap();
  assert_eq!(stored, original);
  let replays = proxy
    .list_messages(&MessageFilter::default().source(Source::Repeater))
    .await
    .unwrap();
  assert_eq!(replays.len(), 1);
  let published = std::iter::from_fn(|| events.try_recv())
    .any(|e| matches!(e, Event::NewMessage(summary) if summary.id == replayed.id));
  assert!(published);

  common::cleanup("replay");
}

#[tokio::test]
async fn test_empty_edits_resend_the_original() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("replay-same", upstream.addr, |_| {}).await;
  common::fetch(addr, "GET http://test.local/same?x=1 HTTP/1.1\r\nHost: test.local\r\n\r\n")
    .await
    .unwrap();
  let original = proxy.list_messages(&MessageFilter::default()).await.unwrap().remove(0);

  let replayed = proxy.replay(original.id, &MessageEdits::default()).await.unwrap();
  assert_eq!(replayed.url, original.url);
  let requests = upstream.requests();
  assert_eq!(requests.len(), 2);
  assert_eq!(requests[0].target, requests[1].target);

  common::cleanup("replay-same");
}

#[tokio::test]
async fn test_unreachable_replays_are_still_recorded() {
  let upstream = common::upstream(common::echo()).await;
  let closed = common::closed_port().await;
  let (proxy, addr) = common::proxy("replay-fail", upstream.addr, |config| {
    config.host_overrides.insert("closed.local".to_string(), closed);
  })
  .await;
  common::fetch(addr, "GET http://test.local/ HTTP/1.1\r\nHost: test.local\r\n\r\n")
    .await
    .unwrap();
  let original = proxy.list_messages(&MessageFilter::default()).await.unwrap().remove(0);

  let edits = MessageEdits::default().url("http://closed.local/");
  let replayed = proxy.replay(original.id, &edits).await.unwrap();
  assert_eq!(replayed.marker, Marker::UpstreamError(UpstreamFailure::Refused));
  let response = replayed.response.as_ref().unwrap();
  assert_eq!(response.status, StatusCode::BAD_GATEWAY);
  assert!(response.is_synthetic());
  assert!(proxy.get_message(replayed.id).await.is_ok());

  common::cleanup("replay-fail");
}

#[tokio::test]
async fn test_replay_rejects_unknown_ids_and_bad_urls() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("replay-invalid", upstream.addr, |_| {}).await;
  assert!(matches!(
    proxy.replay(MessageId::new(), &MessageEdits::default()).await,
    Err(Error::NotFound(_))
  ));

  common::fetch(addr, "GET http://test.local/ HTTP/1.1\r\nHost: test.local\r\n\r\n")
    .await
    .unwrap();
  let original = proxy.list_messages(&MessageFilter::default()).await.unwrap().remove(0);
  let edits = MessageEdits::default().url("ftp://test.local/");
  assert!(proxy.replay(original.id, &edits).await.is_err());
  assert_eq!(upstream.requests().len(), 1);

  common::cleanup("replay-invalid");
}
