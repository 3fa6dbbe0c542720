//! End to end traffic through the proxy listener

mod common;

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use viperscan::codec::{self, Limits};
use viperscan::{
  DecideOutcome, DefaultDecision, InterceptDecision, Marker, Method, MessageFilter, Scheme, Source,
  StatusCode, UpstreamFailure,
};

const GET_HELLO: &str = "GET http://test.local/hello?x=1 HTTP/1.1\r\nHost: test.local\r\n\r\n";

#[tokio::test]
async fn test_plain_requests_are_forwarded_and_recorded() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("plain", upstream.addr, |_| {}).await;

  let response = common::fetch(addr, GET_HELLO).await.expect("no response");
  assert_eq!(response.status, StatusCode::OK);
  assert_eq!(response.headers.get("x-echo"), Some("x=1"));
  assert_eq!(response.headers.get("connection"), Some("keep-alive"));

  let seen = upstream.requests();
  assert_eq!(seen.len(), 1);
  assert_eq!(seen[0].target, "/hello?x=1");
  assert_eq!(seen[0].headers.get("connection"), Some("close"));

  let history = proxy.list_messages(&MessageFilter::default()).await.unwrap();
  assert_eq!(history.len(), 1);
  let message = &history[0];
  assert_eq!(message.source, Source::Proxy);
  assert_eq!(message.marker, Marker::Completed);
  assert_eq!(message.status(), Some(200));
  assert_eq!(message.url.host, "test.local");
  assert!(message.latency_ms.is_some());

  common::cleanup("plain");
}

#[tokio::test]
async fn test_keep_alive_connections_number_their_messages() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("keepalive", upstream.addr, |_| {}).await;

  let mut client = common::Client::connect(addr).await;
  client.send(GET_HELLO).await;
  assert!(client.response().await.is_some());
  client
    .send("GET http://test.local/second HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\n\r\n")
    .await;
  let last = client.response().await.expect("no second response");
  assert_eq!(last.headers.get("connection"), Some("close"));

  let history = proxy.list_messages(&MessageFilter::default()).await.unwrap();
  assert_eq!(history.len(), 2);
  assert_eq!(history[0].connection_id, history[1].connection_id);
  assert_eq!((history[0].sequence, history[1].sequence), (1, 2));
  assert_eq!(history[1].url.path, "/second");

  common::cleanup("keepalive");
}

#[tokio::test]
async fn test_dropped_requests_never_reach_the_target() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("drop", upstream.addr, |_| {}).await;
  proxy.set_intercept(true).await;

  let client = tokio::spawn(async move { common::fetch(addr, GET_HELLO).await });
  let id = common::held(&proxy, 1).await[0].message.id;

  assert_eq!(proxy.decide(id, InterceptDecision::Drop).await.unwrap(), DecideOutcome::Applied);
  assert_eq!(
    proxy.decide(id, InterceptDecision::Forward).await.unwrap(),
    DecideOutcome::AlreadyResolved
  );
  assert!(client.await.unwrap().is_none(), "dropped request got a response");
  assert!(upstream.requests().is_empty());

  let message = proxy.get_message(id).await.unwrap();
  assert_eq!(message.marker, Marker::Dropped);
  assert!(message.intercepted);
  assert!(message.response.is_none());

  common::cleanup("drop");
}

#[tokio::test]
async fn test_edited_requests_are_forwarded_as_edited() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("edit", upstream.addr, |_| {}).await;
  proxy.set_intercept(true).await;

  let client = tokio::spawn(async move { common::fetch(addr, GET_HELLO).await });
  let mut held = common::held(&proxy, 1).await.remove(0).message;
  held.request.headers.insert("X-Injected", "yes");
  held.request.method = Method::POST;
  held.request = held.request.body("a=1");
  let id = held.id;
  proxy
    .decide(id, InterceptDecision::ForwardEdited(Box::new(held)))
    .await
    .unwrap();

  let response = client.await.unwrap().expect("no response");
  assert_eq!(response.status, StatusCode::OK);
  let seen = upstream.requests();
  assert_eq!(seen[0].method, Method::POST);
  assert_eq!(seen[0].headers.get("x-injected"), Some("yes"));
  assert_eq!(seen[0].headers.get("content-length"), Some("3"));
  assert!(proxy.get_message(id).await.unwrap().edited);

  common::cleanup("edit");
}

#[tokio::test]
async fn test_undecided_requests_take_the_default_after_the_timeout() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("timeout", upstream.addr, |config| {
    config.intercept_timeout_ms = 100;
    config.intercept_default = DefaultDecision::Drop;
  })
  .await;
  proxy.set_intercept(true).await;

  assert!(common::fetch(addr, GET_HELLO).await.is_none());
  assert!(proxy.pending_intercepts().await.is_empty());
  let history = proxy.list_messages(&MessageFilter::default()).await.unwrap();
  assert_eq!(history[0].marker, Marker::Dropped);
  assert!(upstream.requests().is_empty());

  common::cleanup("timeout");
}

#[tokio::test]
async fn test_disabling_interception_flushes_in_arrival_order() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("flush", upstream.addr, |_| {}).await;
  proxy.set_intercept(true).await;

  let first = tokio::spawn(async move {
    common::fetch(addr, "GET http://test.local/1 HTTP/1.1\r\nHost: test.local\r\n\r\n").await
  });
  common::held(&proxy, 1).await;
  let second = tokio::spawn(async move {
    common::fetch(addr, "GET http://test.local/2 HTTP/1.1\r\nHost: test.local\r\n\r\n").await
  });
  let pending = common::held(&proxy, 2).await;
  assert_eq!(pending[0].message.url.path, "/1");
  assert_eq!(pending[1].message.url.path, "/2");

  assert_eq!(proxy.set_intercept(false).await, 2);
  assert!(!proxy.is_intercepting().await);
  assert_eq!(first.await.unwrap().map(|r| r.status), Some(StatusCode::OK));
  assert_eq!(second.await.unwrap().map(|r| r.status), Some(StatusCode::OK));

  common::cleanup("flush");
}

#[tokio::test]
async fn test_unreachable_targets_get_a_synthetic_bad_gateway() {
  let closed = common::closed_port().await;
  let (proxy, addr) = common::proxy("unreachable", closed, |_| {}).await;

  let response = common::fetch(addr, GET_HELLO).await.expect("no response");
  assert_eq!(response.status, StatusCode::BAD_GATEWAY);
  assert!(response.headers.contains("x-viperscan-error"));

  let history = proxy.list_messages(&MessageFilter::default()).await.unwrap();
  assert_eq!(history[0].marker, Marker::UpstreamError(UpstreamFailure::Refused));
  assert_eq!(history[0].status(), Some(502));

  common::cleanup("unreachable");
}

#[tokio::test]
async fn test_malformed_requests_are_rejected_and_recorded() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("malformed", upstream.addr, |_| {}).await;

  let raw = "GET http://test.local/ HTTP/1.1\r\nHost: test.local\r\nNo colon here\r\n\r\n";
  let response = common::fetch(addr, raw).await.expect("no response");
  assert_eq!(response.status, StatusCode::BAD_REQUEST);
  assert_eq!(response.headers.get("connection"), Some("close"));

  let history = proxy.list_messages(&MessageFilter::default()).await.unwrap();
  assert_eq!(history.len(), 1);
  assert!(matches!(history[0].marker, Marker::Rejected(_)));
  assert!(upstream.requests().is_empty());

  common::cleanup("malformed");
}

#[tokio::test]
async fn test_control_host_serves_the_root_certificate() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("control", upstream.addr, |_| {}).await;

  let pem = common::fetch(addr, "GET http://viperscan/ca.pem HTTP/1.1\r\nHost: viperscan\r\n\r\n")
    .await
    .expect("no response");
  assert_eq!(pem.status, StatusCode::OK);
  assert_eq!(pem.body.text(), proxy.ca_cert_pem());

  // origin-form requests address the proxy itself
  let der = common::fetch(addr, "GET /ca.der HTTP/1.1\r\nHost: localhost\r\n\r\n")
    .await
    .expect("no response");
  assert_eq!(der.content_type(), Some("application/x-x509-ca-cert"));
  assert!(!der.body.is_empty());

  let missing = common::fetch(addr, "GET /nope HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
  assert_eq!(missing.map(|r| r.status), Some(StatusCode::NOT_FOUND));
  let post = common::fetch(addr, "POST /ca.pem HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await;
  assert_eq!(post.map(|r| r.status), Some(StatusCode::METHOD_NOT_ALLOWED));

  assert!(proxy.list_messages(&MessageFilter::default()).await.unwrap().is_empty());
  assert!(upstream.requests().is_empty());

  common::cleanup("control");
}

async fn open_tunnel(addr: std::net::SocketAddr) -> tokio::io::BufReader<tokio::net::TcpStream> {
  let mut client = common::Client::connect(addr).await;
  client
    .send("CONNECT test.local:443 HTTP/1.1\r\nHost: test.local:443\r\n\r\n")
    .await;
  let mut reader = client.into_inner();
  let head = codec::read_head(&mut reader, Limits::default().max_header_size)
    .await
    .unwrap()
    .expect("no CONNECT reply");
  assert!(head.start_line.starts_with("HTTP/1.1 200"), "{}", head.start_line);
  reader
}

#[tokio::test]
async fn test_connect_tunnels_are_decrypted() {
  let upstream = common::tls_upstream("tls-target", common::echo()).await;
  let (proxy, addr) = common::proxy("tls", upstream.addr, |_| {}).await;

  let tunnel = open_tunnel(addr).await;
  let mut roots = rustls::RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut proxy.ca_cert_pem().as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let config = rustls::ClientConfig::builder_with_provider(Arc::new(
    rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .unwrap()
  .with_root_certificates(roots)
  .with_no_client_auth();
  let server_name = ServerName::try_from("test.local").unwrap().to_owned();
  let mut tls = TlsConnector::from(Arc::new(config))
    .connect(server_name, tunnel)
    .await
    .expect("client should trust the minted leaf");

  tls
    .write_all(b"GET /secure?token=abc HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let mut raw = Vec::new();
  tls.read_to_end(&mut raw).await.ok();
  let response = codec::decode_response(&raw, &Method::GET).await.unwrap();
  assert_eq!(response.status, StatusCode::OK);
  assert_eq!(response.headers.get("x-echo"), Some("token=abc"));

  let history = proxy.list_messages(&MessageFilter::default().host("test.local")).await.unwrap();
  assert_eq!(history.len(), 1);
  assert_eq!(history[0].url.scheme, Scheme::Https);
  assert_eq!(history[0].url.path, "/secure");
  assert_eq!(upstream.requests()[0].target, "/secure?token=abc");

  common::cleanup("tls");
  common::cleanup("tls-target");
}

#[tokio::test]
async fn test_tunnels_are_relayed_when_interception_is_off() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("relay", upstream.addr, |config| {
    config.enable_https_interception = false;
  })
  .await;

  let mut tunnel = open_tunnel(addr).await;
  tunnel
    .write_all(b"GET /raw?y=2 HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  tunnel.flush().await.unwrap();
  let response = codec::read_response(&mut tunnel, &Method::GET, Limits::default())
    .await
    .unwrap();
  assert_eq!(response.headers.get("x-echo"), Some("y=2"));
  assert!(proxy.list_messages(&MessageFilter::default()).await.unwrap().is_empty());

  common::cleanup("relay");
}

#[tokio::test]
async fn test_history_can_be_filtered_exported_and_deleted() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("history", upstream.addr, |_| {}).await;
  common::fetch(addr, GET_HELLO).await.unwrap();
  common::fetch(
    addr,
    "POST http://test.local/login HTTP/1.1\r\nHost: test.local\r\nContent-Length: 3\r\n\r\na=1",
  )
  .await
  .unwrap();

  let posts = proxy.list_messages(&MessageFilter::default().method("post")).await.unwrap();
  assert_eq!(posts.len(), 1);
  let searched = proxy.list_messages(&MessageFilter::default().search("HELLO")).await.unwrap();
  assert_eq!(searched.len(), 1);

  let curl = proxy.curl_command(posts[0].id).await.unwrap();
  assert!(curl.starts_with("curl -X POST"));
  assert!(curl.contains("--data-binary 'a=1'"));

  let exported = proxy.export_messages(&MessageFilter::default()).await.unwrap();
  let value: serde_json::Value = serde_json::from_str(&exported).unwrap();
  assert_eq!(value.as_array().map(|a| a.len()), Some(2));

  proxy.delete_message(posts[0].id).await.unwrap();
  assert!(proxy.get_message(posts[0].id).await.is_err());
  assert_eq!(proxy.list_messages(&MessageFilter::default()).await.unwrap().len(), 1);

  common::cleanup("history");
}

#[tokio::test]
async fn test_connection_order_holds_under_concurrent_traffic() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("ordering", upstream.addr, |_| {}).await;

  let run = |tag: &'static str| async move {
    let mut client = common::Client::connect(addr).await;
    for i in 1..=5 {
      client
        .send(&format!(
          "GET http://test.local/{}{} HTTP/1.1\r\nHost: test.local\r\n\r\n",
          tag, i
        ))
        .await;
      assert!(client.response().await.is_some());
    }
  };
  let (c, d) = tokio::join!(tokio::spawn(run("c")), tokio::spawn(run("d")));
  c.unwrap();
  d.unwrap();

  let history = proxy.list_messages(&MessageFilter::default()).await.unwrap();
  assert_eq!(history.len(), 10);
  for tag in ["c", "d"] {
    let ours: Vec<_> = history
      .iter()
      .filter(|m| m.url.path.starts_with(&format!("/{}", tag)))
      .collect();
    let paths: Vec<String> = ours.iter().map(|m| m.url.path.clone()).collect();
    let expected: Vec<String> = (1..=5).map(|i| format!("/{}{}", tag, i)).collect();
    assert_eq!(paths, expected);
    assert!(ours.iter().all(|m| m.connection_id == ours[0].connection_id));
    let sequences: Vec<u64> = ours.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
  }

  common::cleanup("ordering");
}

#[tokio::test]
async fn test_closing_the_client_releases_a_held_request() {
  let upstream = common::upstream(common::echo()).await;
  let (proxy, addr) = common::proxy("client-close", upstream.addr, |_| {}).await;
  proxy.set_intercept(true).await;

  let mut client = common::Client::connect(addr).await;
  client.send(GET_HELLO).await;
  let id = common::held(&proxy, 1).await[0].message.id;
  drop(client);

  let mut released = false;
  for _ in 0..200 {
    if proxy.pending_intercepts().await.is_empty() {
      if let Ok(message) = proxy.get_message(id).await {
        assert_eq!(message.marker, Marker::ClientClosed);
        assert!(message.response.is_none());
        released = true;
        break;
      }
    }
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
  }
  assert!(released, "held request outlived its client");
  assert_eq!(
    proxy.decide(id, InterceptDecision::Forward).await.unwrap(),
    DecideOutcome::AlreadyResolved
  );
  assert!(upstream.requests().is_empty());

  common::cleanup("client-close");
}

#[tokio::test]
async fn test_leaf_failures_only_affect_their_host() {
  let upstream = common::tls_upstream("ca-isolation-target", common::echo()).await;
  let (proxy, addr) = common::proxy("ca-isolation", upstream.addr, |_| {}).await;

  let bad_host = format!("{}.test", "a".repeat(64));
  let mut client = common::Client::connect(addr).await;
  client
    .send(&format!("CONNECT {0}:443 HTTP/1.1\r\nHost: {0}:443\r\n\r\n", bad_host))
    .await;
  let refused = client.response().await.expect("no CONNECT reply");
  assert_eq!(refused.status, StatusCode::BAD_GATEWAY);

  let filter = MessageFilter::default().host(bad_host.as_str());
  let mut history = Vec::new();
  for _ in 0..200 {
    history = proxy.list_messages(&filter).await.unwrap();
    if !history.is_empty() {
      break;
    }
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
  }
  assert_eq!(history.len(), 1);
  assert!(matches!(history[0].marker, Marker::Rejected(_)));

  // other hosts still get a decrypted tunnel
  let _tunnel = open_tunnel(addr).await;

  common::cleanup("ca-isolation");
  common::cleanup("ca-isolation-target");
}
