//! Proxy lifecycle and end-of-session report

use crate::audit::MalwareDatabase;
use crate::ca::CertificateManager;
use crate::config::ProxyConfig;
use crate::env;
use crate::error::Result;
use crate::policy::{AuditPolicy, PolicyEvaluator};
use crate::server::{ProxyContext, ProxyServer};
use crate::upstream::Upstream;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Closing line of a report that lists blocked downloads
pub const EXIT_MESSAGE: &str = "Exiting without installing malicious packages.";

/// A download refused because the package is known malware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedDownload {
  pub name: String,
  pub version: String,
  /// URL the package manager requested
  pub url: String,
}

/// Append-only list of blocked downloads, shared with the policy evaluator
#[derive(Debug, Clone, Default)]
pub struct BlockedDownloads {
  inner: Arc<Mutex<Vec<BlockedDownload>>>,
}

impl BlockedDownloads {
  pub fn record(&self, download: BlockedDownload) {
    self
      .inner
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .push(download);
  }

  /// Copy of everything recorded so far, in order
  pub fn snapshot(&self) -> Vec<BlockedDownload> {
    self
      .inner
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }

  pub fn len(&self) -> usize {
    self
      .inner
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Summary of blocked downloads, one line per distinct `name@version`.
///
/// Empty when nothing was blocked.
pub fn render_report(blocked: &[BlockedDownload]) -> String {
  if blocked.is_empty() {
    return String::new();
  }
  let mut seen = HashSet::new();
  let mut report = String::from("Safe-chain: blocked malicious package downloads:\n");
  for download in blocked {
    if seen.insert((download.name.as_str(), download.version.as_str())) {
      let _ = writeln!(
        report,
        "- {}@{} ({})",
        download.name, download.version, download.url
      );
    }
  }
  report.push_str(EXIT_MESSAGE);
  report.push('\n');
  report
}

/// One running interception proxy and the downloads it blocked.
///
/// ```no_run
/// use safe_chain_proxy::{MalwareList, ProxyConfig, ProxySession};
/// use std::sync::Arc;
///
/// # async fn run() -> safe_chain_proxy::Result<()> {
/// let mut session = ProxySession::start(ProxyConfig::from_env(), Arc::new(MalwareList::new())).await?;
/// let env = session.merge_env(safe_chain_proxy::env::utf8_vars(std::env::vars_os()));
/// // spawn the package manager with `env` ...
/// session.stop().await;
/// let clean = session.verify_no_malicious_packages();
/// # let _ = (env, clean);
/// # Ok(())
/// # }
/// ```
pub struct ProxySession {
  server: ProxyServer,
  ca_cert_path: PathBuf,
  blocked: BlockedDownloads,
}

impl ProxySession {
  /// Load or create the CA, bind the listener and start serving, auditing
  /// package downloads against `database`.
  pub async fn start(config: ProxyConfig, database: Arc<dyn MalwareDatabase>) -> Result<Self> {
    let blocked = BlockedDownloads::default();
    let policy = Arc::new(AuditPolicy::new(database, blocked.clone()));
    Self::start_with_policy(config, blocked, policy).await
  }

  /// Like [`ProxySession::start`] with a custom policy. The session reports
  /// whatever the policy records into `blocked`.
  pub async fn start_with_policy(
    config: ProxyConfig,
    blocked: BlockedDownloads,
    policy: Arc<dyn PolicyEvaluator>,
  ) -> Result<Self> {
    let cert_manager = Arc::new(CertificateManager::new(&config.ca_storage_path).await?);
    let ca_cert_path = cert_manager.ca_cert_path();
    let ctx = ProxyContext {
      cert_manager,
      policy,
      upstream: Upstream::new(&config)?,
    };
    let server = ProxyServer::start(config.listen_addr, ctx, config.shutdown_grace).await?;
    Ok(Self {
      server,
      ca_cert_path,
      blocked,
    })
  }

  /// Port assigned to the listener
  pub fn port(&self) -> u16 {
    self.server.local_addr().port()
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.server.local_addr()
  }

  /// Root certificate the child process must trust
  pub fn ca_cert_path(&self) -> &Path {
    &self.ca_cert_path
  }

  /// Variables that route a child process through this proxy
  pub fn env_vars(&self) -> Vec<(String, String)> {
    env::proxy_env_vars(self.port(), &self.ca_cert_path)
  }

  /// `base` with this proxy's variables merged in, see [`env::merge_env`]
  pub fn merge_env<I, K, V>(&self, base: I) -> HashMap<String, String>
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    env::merge_env(base, &self.env_vars())
  }

  pub fn blocked_downloads(&self) -> Vec<BlockedDownload> {
    self.blocked.snapshot()
  }

  pub fn has_blocked_downloads(&self) -> bool {
    !self.blocked.is_empty()
  }

  /// End-of-session summary, empty when nothing was blocked
  pub fn report(&self) -> String {
    render_report(&self.blocked.snapshot())
  }

  /// `true` when nothing was blocked; otherwise prints the report and
  /// returns `false`.
  pub fn verify_no_malicious_packages(&self) -> bool {
    let blocked = self.blocked.snapshot();
    if blocked.is_empty() {
      return true;
    }
    print!("{}", render_report(&blocked));
    false
  }

  /// Stop the listener. Open connections get the configured grace period.
  pub async fn stop(&mut self) {
    self.server.stop().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn download(name: &str, version: &str) -> BlockedDownload {
    BlockedDownload {
      name: name.to_string(),
      version: version.to_string(),
      url: format!("https://registry.npmjs.org/{0}/-/{0}-{1}.tgz", name, version),
    }
  }

  #[test]
  fn test_empty_report() {
    assert_eq!(render_report(&[]), "");
  }

  #[test]
  fn test_report_lists_each_package_once() {
    let report = render_report(&[
      download("evil-pkg", "1.0.0"),
      download("other-evil", "2.0.0"),
      download("evil-pkg", "1.0.0"),
    ]);
    assert_eq!(report.matches("evil-pkg@1.0.0").count(), 1);
    assert_eq!(report.matches("other-evil@2.0.0").count(), 1);
    assert!(report.contains("https://registry.npmjs.org/evil-pkg/-/evil-pkg-1.0.0.tgz"));
    assert!(report.trim_end().ends_with(EXIT_MESSAGE));
  }

  #[test]
  fn test_blocked_downloads_are_shared() {
    let blocked = BlockedDownloads::default();
    let handle = blocked.clone();
    handle.record(download("evil-pkg", "1.0.0"));
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked.snapshot()[0].name, "evil-pkg");
  }

  #[tokio::test]
  async fn test_session_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
      ca_storage_path: dir.path().to_path_buf(),
      ..ProxyConfig::default()
    };
    let mut session = ProxySession::start(config, Arc::new(crate::MalwareList::new()))
      .await
      .unwrap();

    assert_ne!(session.port(), 0);
    assert!(session.ca_cert_path().exists());
    let vars: HashMap<_, _> = session.env_vars().into_iter().collect();
    assert_eq!(
      vars[env::HTTPS_PROXY],
      format!("http://localhost:{}", session.port())
    );
    assert!(session.verify_no_malicious_packages());
    assert_eq!(session.report(), "");

    session.stop().await;
    session.stop().await;
  }

  #[tokio::test]
  async fn test_verify_fails_after_blocked_download() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
      ca_storage_path: dir.path().to_path_buf(),
      ..ProxyConfig::default()
    };
    let blocked = BlockedDownloads::default();
    let policy = Arc::new(AuditPolicy::new(
      Arc::new(crate::MalwareList::new()),
      blocked.clone(),
    ));
    let mut session = ProxySession::start_with_policy(config, blocked.clone(), policy)
      .await
      .unwrap();

    blocked.record(download("evil-pkg", "1.0.0"));
    assert!(session.has_blocked_downloads());
    assert!(!session.verify_no_malicious_packages());
    assert!(session.report().contains("evil-pkg@1.0.0"));
    session.stop().await;
  }
}
