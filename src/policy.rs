//! Per-request download policy

use crate::audit::{audit_changes, MalwareDatabase, PackageChange};
use crate::error::Result;
use crate::package_url::parse_package_from_url;
use crate::session::{BlockedDownload, BlockedDownloads};
use std::sync::Arc;

/// What the MITM terminator should do with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
  /// Forward the request upstream
  Allow,
  /// Answer 403 without contacting the upstream
  Block {
    /// Reason reported by the audit
    reason: String,
  },
}

/// Decides whether an intercepted request may proceed.
///
/// An `Err` means no verdict could be reached; the terminator refuses the
/// request rather than forwarding an unscanned download.
#[async_trait::async_trait]
pub trait PolicyEvaluator: Send + Sync {
  async fn evaluate(&self, url: &str) -> Result<Decision>;
}

/// Policy backed by the malware audit gate.
///
/// URLs that do not resolve to a package are allowed. Package downloads are
/// audited as a single pending addition; a refusal is recorded as a
/// [`BlockedDownload`].
pub struct AuditPolicy {
  database: Arc<dyn MalwareDatabase>,
  blocked: BlockedDownloads,
}

impl AuditPolicy {
  pub fn new(database: Arc<dyn MalwareDatabase>, blocked: BlockedDownloads) -> Self {
    Self { database, blocked }
  }
}

#[async_trait::async_trait]
impl PolicyEvaluator for AuditPolicy {
  async fn evaluate(&self, url: &str) -> Result<Decision> {
    let Some(package) = parse_package_from_url(url) else {
      return Ok(Decision::Allow);
    };
    tracing::debug!("[policy] auditing {} from {}", package, url);

    let changes = [PackageChange::add(package.clone())];
    let verdict = audit_changes(self.database.as_ref(), &changes).await?;
    match verdict.disallowed_changes.into_iter().next() {
      None => Ok(Decision::Allow),
      Some(disallowed) => {
        tracing::warn!(
          "[policy] blocked {} ({}): {}",
          package,
          disallowed.reason,
          url
        );
        self.blocked.record(BlockedDownload {
          name: package.name,
          version: package.version,
          url: url.to_string(),
        });
        Ok(Decision::Block {
          reason: disallowed.reason,
        })
      }
    }
  }
}
