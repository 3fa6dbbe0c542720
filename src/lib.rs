#![cfg_attr(docsrs, feature(doc_cfg))]

//! # viperscan
//!
//! An intercepting HTTP/HTTPS proxy with a pause/edit/forward pipeline and a
//! passive/active vulnerability scan engine.
//!
//! Everything hangs off one [`ViperProxy`]:
//!
//! - Client traffic is captured into history and can be held for a decision
//!   (forward, edit, drop) while interception is on.
//! - `CONNECT` tunnels are decrypted with leaf certificates minted by a local
//!   root CA, fetchable at `http://viperscan/ca.pem` through the proxy.
//! - Every captured exchange is passively analyzed; active scans send probes
//!   through a shared, bounded worker pool.
//! - The repeater re-sends edited copies of captured messages and the fuzzer
//!   substitutes payloads into a marked request template.
//! - All of it is published on an [`EventBus`].
//!
//! ## Running the proxy
//!
//! ```rust,no_run
//! # async fn run() -> viperscan::Result<()> {
//! let config = viperscan::ViperConfig::default();
//! let proxy = viperscan::ViperProxy::new(config).await?;
//! println!("trust {}", proxy.ca_cert_path().display());
//! proxy.start().await
//! # }
//! ```
//!
//! ## Scanning
//!
//! ```rust,no_run
//! # async fn run(proxy: viperscan::ViperProxy) -> viperscan::Result<()> {
//! use viperscan::{Event, ScanProfile};
//! let mut events = proxy.subscribe();
//! let session = proxy.start_scan("http://test.local/search?q=x", ScanProfile::Quick).await?;
//! while let Some(event) = events.recv().await {
//!   if let Event::ScanCompleted { session_id, .. } = event {
//!     if session_id == session {
//!       break;
//!     }
//!   }
//! }
//! for finding in proxy.list_findings(Some(session)).await? {
//!   println!("{:?} {} {}", finding.severity, finding.title, finding.url);
//! }
//! # Ok(())
//! # }
//! ```
mod body;
mod ca;
mod client;
/// HTTP/1.x wire codec
pub mod codec;
mod config;
mod connection;
mod connector;
mod control;
mod errors;
mod events;
/// Payload fuzzing
pub mod fuzz;
mod headers;
mod ids;
mod intercept;
mod message;
mod proxy;
/// record info
pub mod record;
mod repeater;
mod request;
mod response;
/// Passive and active scanning
pub mod scan;
mod server;
mod socket;
mod storage;
mod tls;

pub use body::Body;
pub use ca::{CertificateAuthority, CertificateManager, LeafCertificate};
pub use client::{Transport, UpstreamClient};
pub use codec::Limits;
pub use config::ViperConfig;
pub use connector::{Connector, ConnectorBuilder};
pub use control::{stream_events, ControlReply, ControlSurface};
pub use errors::{Error, ParseFailure, Result, UpstreamFailure};
pub use events::{Event, EventBus, Subscription};
pub use fuzz::{FuzzJob, FuzzResult, FuzzSpec, FuzzStatus, Fuzzer, PayloadSource};
pub use headers::Headers;
pub use http::{Method, StatusCode, Version};
pub use ids::{FindingId, JobId, MessageId, SessionId};
pub use intercept::{
  DecideOutcome, DefaultDecision, InterceptDecision, InterceptFilter, InterceptPhase, InterceptQueue,
  InterceptSettings, PendingIntercept, Resolution,
};
pub use message::{Marker, Message, MessageFilter, MessageSummary, Source};
pub use proxy::ViperProxy;
pub use repeater::{MessageEdits, Repeater};
pub use request::{HttpRequest, Scheme, Url};
pub use response::HttpResponse;
pub use scan::{Finding, ScanEngine, ScanProfile, ScanSession, ScanSettings, Severity, SessionStatus};
pub use server::{ProxyServer, ProxyState};
pub use socket::MaybeTlsStream;
pub use storage::{MemoryStorage, Storage};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
