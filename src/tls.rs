//! TLS configuration for both sides of an intercepted connection

use crate::ca::LeafCertificate;
use crate::error::{Error, Result};
use rustls_pki_types::CertificateDer;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

/// Only HTTP/1.1 is spoken on intercepted connections
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// The installed process-wide provider, or ring
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Server side of an intercepted connection, presenting `leaf`
pub(crate) fn server_config(leaf: &LeafCertificate) -> Result<ServerConfig> {
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(leaf.cert_chain.clone(), leaf.private_key())
    .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(config)
}

/// Client side towards real registries: the platform trust store plus
/// `extra_roots`.
pub(crate) fn client_config(extra_roots: &[CertificateDer<'static>]) -> Result<ClientConfig> {
  let mut root_cert_store = RootCertStore::empty();
  let native = rustls_native_certs::load_native_certs();
  for error in &native.errors {
    tracing::debug!("[tls] skipping platform certificate source: {}", error);
  }
  let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
  tracing::debug!(
    "[tls] loaded {} platform roots ({} ignored)",
    added,
    ignored
  );
  for cert in extra_roots {
    root_cert_store
      .add(cert.clone())
      .map_err(|e| Error::tls_error(format!("Invalid extra root certificate: {}", e)))?;
  }

  let mut config = ClientConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Invalid TLS versions: {}", e)))?
    .with_root_certificates(root_cert_store)
    .with_no_client_auth();
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::CertificateAuthority;

  #[tokio::test]
  async fn test_server_config_from_leaf() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::new(dir.path()).await.unwrap();
    let leaf = ca.issue_leaf("registry.npmjs.org").unwrap();
    let config = server_config(&leaf).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }

  #[tokio::test]
  async fn test_client_config_accepts_extra_root() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::new(dir.path()).await.unwrap();
    assert!(client_config(&[ca.ca_cert_der().clone()]).is_ok());
  }
}
