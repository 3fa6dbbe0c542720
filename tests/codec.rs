//! Wire codec behavior on complete messages

use viperscan::codec::{self, Limits};
use viperscan::{Error, Method, StatusCode};

#[tokio::test]
async fn test_chunked_bodies_are_normalized() {
  let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: gone\r\n\r\n";
  let response = codec::decode_response(raw, &Method::GET).await.unwrap();
  assert_eq!(response.body.as_ref(), b"hello world");
  assert_eq!(response.headers.get("content-length"), Some("11"));
  assert!(!response.headers.contains("transfer-encoding"));
  assert!(!response.headers.contains("x-trailer"));
}

#[tokio::test]
async fn test_canonical_messages_encode_byte_for_byte() {
  let raw: &[u8] = b"POST /login?next=%2F HTTP/1.1\r\nHost: a.test\r\nX-Custom:  kept-spelling\r\nContent-Length: 7\r\n\r\nuser=me";
  let request = codec::decode_request(raw).await.unwrap();
  assert_eq!(request.headers.get("X-CUSTOM"), Some("kept-spelling"));
  let canonical: &[u8] = b"POST /login?next=%2F HTTP/1.1\r\nHost: a.test\r\nX-Custom: kept-spelling\r\nContent-Length: 7\r\n\r\nuser=me";
  assert_eq!(codec::encode_request(&request).as_ref(), canonical);

  let raw: &[u8] = b"HTTP/1.1 404 Nothing Here\r\nContent-Length: 2\r\n\r\nno";
  let response = codec::decode_response(raw, &Method::GET).await.unwrap();
  assert_eq!(codec::encode_response(&response).as_ref(), raw);
}

#[tokio::test]
async fn test_bare_lf_line_endings_are_accepted() {
  let request = codec::decode_request(b"GET / HTTP/1.1\nHost: a.test\n\n").await.unwrap();
  assert_eq!(request.method, Method::GET);
  assert_eq!(request.headers.get("host"), Some("a.test"));
}

#[tokio::test]
async fn test_head_and_no_content_responses_have_no_body() {
  let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
  let response = codec::decode_response(raw, &Method::HEAD).await.unwrap();
  assert!(response.body.is_empty());
  assert_eq!(response.headers.get("content-length"), Some("10"));

  let raw: &[u8] = b"HTTP/1.1 204 No Content\r\n\r\n";
  let response = codec::decode_response(raw, &Method::GET).await.unwrap();
  assert_eq!(response.status, StatusCode::NO_CONTENT);
  assert!(response.body.is_empty());
}

#[tokio::test]
async fn test_interim_responses_are_skipped() {
  let raw: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n";
  let response = codec::decode_response(raw, &Method::POST).await.unwrap();
  assert_eq!(response.status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_unframed_responses_read_until_close() {
  let raw: &[u8] = b"HTTP/1.0 200 OK\r\n\r\nall of it";
  let response = codec::decode_response(raw, &Method::GET).await.unwrap();
  assert_eq!(response.body.as_ref(), b"all of it");
}

#[tokio::test]
async fn test_conflicting_lengths_are_malformed() {
  let raw: &[u8] = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabcd";
  let err = codec::decode_request(raw).await.unwrap_err();
  assert!(matches!(err, Error::Parse { .. }));
  assert_eq!(err.rejection_status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_limits_apply_to_bodies() {
  let limits = Limits {
    max_header_size: 1024,
    max_body_size: 4,
  };
  let mut raw: &[u8] = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde";
  let err = codec::read_request(&mut raw, limits).await.unwrap_err();
  assert_eq!(err.rejection_status(), StatusCode::PAYLOAD_TOO_LARGE);

  let mut raw: &[u8] = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nabcde\r\n0\r\n\r\n";
  let err = codec::read_request(&mut raw, limits).await.unwrap_err();
  assert_eq!(err.rejection_status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_huge_chunk_sizes_are_rejected_not_wrapped() {
  let mut raw: &[u8] =
    b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\nffffffffffffffff\r\nb\r\n0\r\n\r\n";
  let err = codec::read_request(&mut raw, Limits::default()).await.unwrap_err();
  assert_eq!(err.rejection_status(), StatusCode::PAYLOAD_TOO_LARGE);

  let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\nfffffffffffffffe\r\n\r\n";
  assert!(codec::decode_response(raw, &Method::GET).await.is_err());
}
