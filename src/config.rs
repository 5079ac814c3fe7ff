//! Proxy configuration

use crate::error::{Error, Result};
use crate::upstream::UpstreamProxy;
use rustls_pki_types::CertificateDer;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Grace period granted to open connections when the proxy stops
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// `~/.safe-chain/certs`
pub fn default_ca_storage_path() -> PathBuf {
  dirs::home_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join(".safe-chain")
    .join("certs")
}

/// Configuration for the interception proxy
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// Directory holding `ca-cert.pem` and `ca-key.pem`
  pub ca_storage_path: PathBuf,
  /// Listen address; port 0 lets the OS pick a free port
  pub listen_addr: SocketAddr,
  /// Optional upstream proxy for outbound registry connections
  pub upstream_proxy: Option<UpstreamProxy>,
  /// How long `stop` waits for open connections before dropping them
  pub shutdown_grace: Duration,
  /// Roots trusted for outbound TLS in addition to the platform store
  pub extra_root_certs: Vec<CertificateDer<'static>>,
  /// Fixed addresses for outbound hostnames, bypassing DNS
  pub resolve_overrides: HashMap<String, SocketAddr>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      ca_storage_path: default_ca_storage_path(),
      listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
      upstream_proxy: None,
      shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
      extra_root_certs: Vec::new(),
      resolve_overrides: HashMap::new(),
    }
  }
}

impl ProxyConfig {
  /// Defaults, with the upstream proxy taken from `HTTPS_PROXY`/`https_proxy`
  pub fn from_env() -> Self {
    Self {
      upstream_proxy: UpstreamProxy::from_env(),
      ..Self::default()
    }
  }

  /// Trust every certificate in `pem` for outbound connections
  pub fn add_root_certificates_pem(&mut self, pem: &[u8]) -> Result<()> {
    let mut reader = pem;
    let mut found = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
      let cert =
        cert.map_err(|e| Error::config_error(format!("Invalid root certificate PEM: {}", e)))?;
      self.extra_root_certs.push(cert);
      found += 1;
    }
    if found == 0 {
      return Err(Error::config_error("No certificate found in PEM"));
    }
    Ok(())
  }

  /// Connect to `addr` whenever `host` is the outbound target
  pub fn resolve(mut self, host: impl Into<String>, addr: SocketAddr) -> Self {
    self.resolve_overrides.insert(host.into(), addr);
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = ProxyConfig::default();
    assert_eq!(config.listen_addr.port(), 0);
    assert!(config.listen_addr.ip().is_loopback());
    assert!(config.ca_storage_path.ends_with(".safe-chain/certs"));
    assert_eq!(config.shutdown_grace, Duration::from_secs(1));
    assert!(config.upstream_proxy.is_none());
  }

  #[test]
  fn test_add_root_certificates_rejects_empty_pem() {
    let mut config = ProxyConfig::default();
    assert!(config.add_root_certificates_pem(b"nothing here").is_err());
  }

  #[test]
  fn test_resolve_override() {
    let addr: SocketAddr = "127.0.0.1:9443".parse().unwrap();
    let config = ProxyConfig::default().resolve("registry.npmjs.org", addr);
    assert_eq!(config.resolve_overrides["registry.npmjs.org"], addr);
  }
}
