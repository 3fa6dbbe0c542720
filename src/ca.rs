//! Certificate Authority (CA) management for TLS interception
//!
//! A root CA is generated on first run and stored on disk so clients can trust
//! it; later runs load the same root. Leaf certificates are issued per host on
//! demand and cached for the life of the process.
//!

use crate::errors::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Leaf validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Root validity in days
const ROOT_TTL_DAYS: i64 = 3650;

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// A certificate chain `[leaf, root]` and the leaf's private key.
#[derive(Debug)]
pub struct LeafCertificate {
  pub cert_chain: Vec<CertificateDer<'static>>,
  pub key: PrivateKeyDer<'static>,
}

impl Clone for LeafCertificate {
  fn clone(&self) -> Self {
    Self {
      cert_chain: self.cert_chain.clone(),
      key: self.key.clone_key(),
    }
  }
}

/// Certificate Authority for generating certificates
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  /// Storage path for certificates
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the CA stored under `storage_path`, generating and saving one when absent.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    fs::create_dir_all(&storage_path)
      .await
      .map_err(|e| Error::ca(format!("cannot create {}: {}", storage_path.display(), e)))?;

    let ca_cert_path = storage_path.join(CA_CERT_FILE);
    let ca_key_path = storage_path.join(CA_KEY_FILE);

    let (cert_pem, key_pair) = if ca_cert_path.exists() && ca_key_path.exists() {
      tracing::info!(path = %ca_cert_path.display(), "loading root CA");
      Self::load_ca(&ca_cert_path, &ca_key_path).await?
    } else {
      tracing::info!(path = %ca_cert_path.display(), "generating root CA");
      Self::generate_ca(&ca_cert_path, &ca_key_path).await?
    };

    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::ca("No certificate found in PEM"))?
      .map_err(|e| Error::ca(format!("Failed to parse PEM: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::ca(format!("Failed to create issuer from CA cert: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem,
      storage_path,
    })
  }

  async fn load_ca(cert_path: &Path, key_path: &Path) -> Result<(String, KeyPair)> {
    let cert_pem = fs::read_to_string(cert_path)
      .await
      .map_err(|e| Error::ca(format!("Failed to read CA cert: {}", e)))?;
    let key_pem = fs::read_to_string(key_path)
      .await
      .map_err(|e| Error::ca(format!("Failed to read CA key: {}", e)))?;
    let key_pair =
      KeyPair::from_pem(&key_pem).map_err(|e| Error::ca(format!("Failed to parse CA key: {}", e)))?;
    Ok((cert_pem, key_pair))
  }

  async fn generate_ca(cert_path: &Path, key_path: &Path) -> Result<(String, KeyPair)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "ViperScan Root CA");
    dn.push(DnType::OrganizationName, "ViperScan");
    dn.push(DnType::OrganizationalUnitName, "Interception Proxy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair =
      KeyPair::generate().map_err(|e| Error::ca(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::ca(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    fs::write(cert_path, cert_pem.as_bytes())
      .await
      .map_err(|e| Error::ca(format!("Failed to save CA cert: {}", e)))?;
    fs::write(key_path, key_pair.serialize_pem().as_bytes())
      .await
      .map_err(|e| Error::ca(format!("Failed to save CA key: {}", e)))?;

    Ok((cert_pem, key_pair))
  }

  /// Issue a leaf certificate for `host` signed by the root.
  pub fn issue_leaf(&self, host: &str) -> Result<LeafCertificate> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    // IP literals get an IP SAN plus a DNS SAN; clients disagree on which one they check.
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else if is_dns_name(host) {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::ca(format!("Invalid domain name: {}", host))
      })?)]
    } else {
      return Err(Error::ca(format!("Invalid domain name: {}", host)));
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair =
      KeyPair::generate().map_err(|e| Error::ca(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::ca(format!("Failed to sign certificate for {}: {}", host, e)))?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::ca("Failed to serialize leaf key"))?;

    Ok(LeafCertificate {
      cert_chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      key,
    })
  }

  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }
}

/// Labels of letters, digits, `-` and `_`, at most 63 bytes each.
fn is_dns_name(host: &str) -> bool {
  let host = host.strip_suffix('.').unwrap_or(host);
  !host.is_empty()
    && host.len() <= 253
    && host.split('.').all(|label| {
      !label.is_empty()
        && label.len() <= 63
        && label
          .bytes()
          .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

/// Issues leaf certificates on demand and keeps them for the process lifetime.
pub struct CertificateManager {
  ca: CertificateAuthority,
  cert_cache: Cache<String, Arc<LeafCertificate>>,
}

impl CertificateManager {
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::new(storage_path).await?;
    let cert_cache = Cache::builder().build();
    Ok(Self { ca, cert_cache })
  }

  /// Leaf certificate for `host`.
  ///
  /// Concurrent first requests for the same host wait on a single issuance.
  pub async fn get_leaf_certificate(&self, host: &str) -> Result<Arc<LeafCertificate>> {
    let key = host.to_ascii_lowercase();
    self
      .cert_cache
      .try_get_with(key.clone(), async {
        tracing::debug!(host = %key, "issuing leaf certificate");
        self.ca.issue_leaf(&key).map(Arc::new)
      })
      .await
      .map_err(|e| Error::Ca(format!("{}: {}", host, e)))
  }

  pub fn ca_cert_pem(&self) -> &str {
    self.ca.ca_cert_pem()
  }

  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    self.ca.ca_cert_der()
  }

  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }
}
