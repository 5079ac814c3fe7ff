//! Certificate Authority (CA) management for registry interception
//!
//! The root CA lives in two PEM files and is reused across runs until it is
//! within an hour of expiring. Leaf certificates are issued per hostname on
//! first use and kept for the rest of the process.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Subject and issuer common name of the root CA
pub const ROOT_CA_COMMON_NAME: &str = "safe-chain proxy";
/// Root certificate file name
pub const CA_CERT_FILE: &str = "ca-cert.pem";
/// Root private key file name
pub const CA_KEY_FILE: &str = "ca-key.pem";

/// Root CA validity (1 day)
const CA_VALIDITY: Duration = Duration::days(1);
/// A stored root closer than this to expiry is replaced
const CA_RENEWAL_THRESHOLD: Duration = Duration::hours(1);
/// Leaf certificate validity (1 hour)
const LEAF_VALIDITY: Duration = Duration::hours(1);
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// A per-hostname certificate signed by the root CA
pub struct LeafCertificate {
  /// Hostname the certificate was issued for
  pub hostname: String,
  /// `[leaf, root]`
  pub cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl LeafCertificate {
  /// The leaf certificate itself
  pub fn certificate(&self) -> &CertificateDer<'static> {
    &self.cert_chain[0]
  }

  /// The leaf private key
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }
}

/// Root certificate authority
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
  /// Storage path for certificates
  storage_path: PathBuf,
}

struct RootMaterial {
  issuer: Issuer<'static, KeyPair>,
  cert_der: CertificateDer<'static>,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
}

impl CertificateAuthority {
  /// Load the root CA from `storage_path`, or generate and persist a new one
  /// when it is missing, unreadable as PEM, or about to expire.
  ///
  /// Failing to create the directory or write the files is an error: the
  /// proxy can not intercept anything without a CA.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    fs::create_dir_all(&storage_path).await.map_err(|e| {
      Error::certificate_error(format!(
        "Failed to create CA directory {}: {}",
        storage_path.display(),
        e
      ))
    })?;

    let ca_cert_path = storage_path.join(CA_CERT_FILE);
    let ca_key_path = storage_path.join(CA_KEY_FILE);

    let existing = if ca_cert_path.exists() && ca_key_path.exists() {
      Self::load_ca(&ca_cert_path, &ca_key_path).await?
    } else {
      None
    };
    let root = match existing {
      Some(root) => root,
      None => Self::generate_ca(&ca_cert_path, &ca_key_path).await?,
    };

    Ok(Self {
      issuer: root.issuer,
      ca_cert_der: root.cert_der,
      not_before: root.not_before,
      not_after: root.not_after,
      storage_path,
    })
  }

  /// Load an existing CA. `Ok(None)` means it must be replaced.
  async fn load_ca(cert_path: &Path, key_path: &Path) -> Result<Option<RootMaterial>> {
    let (cert_pem, key_pem) = match (
      String::from_utf8(fs::read(cert_path).await?),
      String::from_utf8(fs::read(key_path).await?),
    ) {
      (Ok(cert_pem), Ok(key_pem)) => (cert_pem, key_pem),
      _ => {
        tracing::warn!("[ca] stored CA is not valid PEM text, regenerating");
        return Ok(None);
      }
    };

    let cert_der = match rustls_pemfile::certs(&mut cert_pem.as_bytes()).next() {
      Some(Ok(cert_der)) => cert_der,
      Some(Err(e)) => {
        tracing::warn!("[ca] stored CA certificate is unreadable, regenerating: {}", e);
        return Ok(None);
      }
      None => {
        tracing::warn!("[ca] no certificate in {}, regenerating", cert_path.display());
        return Ok(None);
      }
    };
    let (not_before, not_after) = match x509_parser::parse_x509_certificate(&cert_der) {
      Ok((_, cert)) => (
        cert.validity().not_before.to_datetime(),
        cert.validity().not_after.to_datetime(),
      ),
      Err(e) => {
        tracing::warn!("[ca] stored CA certificate is unreadable, regenerating: {}", e);
        return Ok(None);
      }
    };
    if not_after - OffsetDateTime::now_utc() < CA_RENEWAL_THRESHOLD {
      tracing::info!("[ca] stored CA expires at {}, regenerating", not_after);
      return Ok(None);
    }

    let key_pair = match KeyPair::from_pem(&key_pem) {
      Ok(key_pair) => key_pair,
      Err(e) => {
        tracing::warn!("[ca] stored CA key is unreadable, regenerating: {}", e);
        return Ok(None);
      }
    };
    let issuer = match Issuer::from_ca_cert_pem(&cert_pem, key_pair) {
      Ok(issuer) => issuer,
      Err(e) => {
        tracing::warn!("[ca] stored CA does not match its key, regenerating: {}", e);
        return Ok(None);
      }
    };

    tracing::debug!("[ca] reusing CA from {}", cert_path.display());
    Ok(Some(RootMaterial {
      issuer,
      cert_der,
      not_before,
      not_after,
    }))
  }

  /// Generate a new CA certificate and key, overwriting any previous pair
  async fn generate_ca(cert_path: &Path, key_path: &Path) -> Result<RootMaterial> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_CA_COMMON_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + CA_VALIDITY;

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    write_private_file(key_path, key_pair.serialize_pem().as_bytes()).await?;
    write_file(cert_path, cert_pem.as_bytes()).await?;
    tracing::info!("[ca] generated new CA at {}", cert_path.display());

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to create issuer: {}", e)))?;

    Ok(RootMaterial {
      issuer,
      cert_der,
      not_before: params.not_before,
      not_after: params.not_after,
    })
  }

  /// Generate a leaf certificate for `hostname` signed by this CA
  pub fn issue_leaf(&self, hostname: &str) -> Result<LeafCertificate> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    // IP literals get an IP SAN as well, some clients only check that one.
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", hostname))
      })?)]
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + LEAF_VALIDITY;

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign leaf cert: {}", e)))?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("Failed to serialize leaf key"))?;

    Ok(LeafCertificate {
      hostname: hostname.to_string(),
      cert_chain: vec![CertificateDer::from(cert.der().to_vec()), self.ca_cert_der.clone()],
      key,
    })
  }

  /// Root certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Get CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }

  pub fn not_before(&self) -> OffsetDateTime {
    self.not_before
  }

  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
  let mut file = fs::File::create(path).await.map_err(|e| {
    Error::certificate_error(format!("Failed to write {}: {}", path.display(), e))
  })?;
  file.write_all(contents).await?;
  file.flush().await?;
  Ok(())
}

/// Like [`write_file`], but readable by the owner only on unix
async fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
  let mut options = fs::OpenOptions::new();
  options.write(true).create(true).truncate(true);
  #[cfg(unix)]
  options.mode(0o600);
  let mut file = options.open(path).await.map_err(|e| {
    Error::certificate_error(format!("Failed to write {}: {}", path.display(), e))
  })?;
  file.write_all(contents).await?;
  file.flush().await?;
  Ok(())
}

/// Issues and caches leaf certificates.
///
/// The cache never evicts: a run intercepts a handful of registry hosts and
/// ends long before a leaf expires. A long-lived daemon would need a TTL here.
pub struct CertificateManager {
  ca: Arc<CertificateAuthority>,
  leaf_cache: Cache<String, Arc<LeafCertificate>>,
}

impl CertificateManager {
  /// Create a new certificate manager
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::new(storage_path).await?;
    Ok(Self::from_authority(ca))
  }

  pub fn from_authority(ca: CertificateAuthority) -> Self {
    Self {
      ca: Arc::new(ca),
      leaf_cache: Cache::builder().build(),
    }
  }

  /// Return the cached leaf for `hostname`, issuing it on first use.
  ///
  /// Concurrent first requests for one hostname share a single issuance.
  pub async fn issue_leaf_certificate(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
    let key = hostname.to_ascii_lowercase();
    let ca = self.ca.clone();
    let host = key.clone();
    self
      .leaf_cache
      .try_get_with(key, async move {
        // RSA key generation is CPU bound
        let leaf = tokio::task::spawn_blocking(move || ca.issue_leaf(&host))
          .await
          .map_err(|e| Error::certificate_error(format!("Leaf issuance panicked: {}", e)))??;
        tracing::debug!("[ca] issued leaf certificate for {}", leaf.hostname);
        Ok::<_, Error>(Arc::new(leaf))
      })
      .await
      .map_err(|e| Error::certificate_error(e.to_string()))
  }

  /// Get the CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }

  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }
}
