//! Run the intercepting proxy and print every event it publishes
//!
//! To run:
//! ```bash
//! RUST_LOG=viperscan=debug cargo run --example viperscan_proxy -- [config.json]
//! ```
//!
//! Then point a browser at `127.0.0.1:8080` and install the CA from
//! `http://viperscan/ca.pem`.

use tracing_subscriber::EnvFilter;
use viperscan::{ViperConfig, ViperProxy};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = match std::env::args().nth(1) {
    Some(path) => ViperConfig::from_json_file(path)?,
    None => ViperConfig::default(),
  };
  let listen = config.listen_addr;
  let proxy = ViperProxy::new(config).await?;

  println!("=== ViperScan ===");
  println!("proxy listening on {}", listen);
  println!("CA certificate: {}", proxy.ca_cert_path().display());
  println!("Trust it, or fetch it through the proxy at http://viperscan/ca.pem\n");

  let mut events = proxy.subscribe();
  tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      if let Ok(line) = serde_json::to_string(&event) {
        println!("{}", line);
      }
    }
  });

  proxy.start().await?;
  Ok(())
}
