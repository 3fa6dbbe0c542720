//! rustls configuration for both sides of an intercepted connection.
use crate::errors::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, Error as TLSError, SignatureScheme};

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Accepts any upstream certificate. A testing proxy has to reach targets with
/// self-signed or expired certificates.
#[derive(Debug)]
pub(crate) struct NoVerifier {
  schemes: Vec<SignatureScheme>,
}

impl NoVerifier {
  fn new(provider: &CryptoProvider) -> Self {
    Self {
      schemes: provider
        .signature_verification_algorithms
        .supported_schemes(),
    }
  }
}

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.schemes.clone()
  }
}

/// Read every certificate in a PEM bundle.
pub fn load_pem_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
  let pem = std::fs::read(path)
    .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
  rustls_pemfile::certs(&mut pem.as_slice())
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::config(format!("invalid PEM in {}: {}", path.display(), e)))
}

/// Client side configuration for upstream connections.
///
/// With `verify` unset every certificate is accepted; otherwise only chains
/// ending in one of `extra_roots` are trusted.
pub fn client_config(verify: bool, extra_roots: &[CertificateDer<'static>]) -> Result<rustls::ClientConfig> {
  let provider = provider();
  let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
    .with_safe_default_protocol_versions()?;
  let config = if verify {
    let mut roots = rustls::RootCertStore::empty();
    for cert in extra_roots {
      roots.add(cert.clone())?;
    }
    builder.with_root_certificates(roots).with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier::new(&provider)))
      .with_no_client_auth()
  };
  Ok(config)
}

/// Server side configuration presenting `cert_chain` to the intercepted client.
pub fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig> {
  let mut config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::ca(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(config)
}
