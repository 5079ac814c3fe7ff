//! Malware audit gate
//!
//! [`audit_changes`] is the single verdict function shared by the proxy and by
//! install-time scanners. It only depends on the changes it is given and on
//! the current snapshot of the [`MalwareDatabase`].

use crate::error::{Error, Result};
use crate::package_url::PackageReference;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Reason reported when a feed entry carries none
pub const DEFAULT_MALWARE_REASON: &str = "MALWARE";

/// Kind of change a package manager is about to make
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
  /// A package that is not installed yet
  Add,
  /// An installed package moving to another version
  Change,
  /// A package being uninstalled
  Remove,
}

/// A pending package change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageChange {
  pub name: String,
  pub version: String,
  pub change_type: ChangeType,
}

impl PackageChange {
  /// A pending install of `package`
  pub fn add(package: PackageReference) -> Self {
    Self {
      name: package.name,
      version: package.version,
      change_type: ChangeType::Add,
    }
  }
}

/// A change the audit refused, with the database's reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisallowedChange {
  pub change: PackageChange,
  pub reason: String,
}

/// Outcome of [`audit_changes`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditVerdict {
  pub allowed_changes: Vec<PackageChange>,
  pub disallowed_changes: Vec<DisallowedChange>,
}

impl AuditVerdict {
  /// True iff nothing was disallowed
  pub fn is_allowed(&self) -> bool {
    self.disallowed_changes.is_empty()
  }
}

/// Verdict source mapping `(name, version)` to "known malicious".
#[async_trait::async_trait]
pub trait MalwareDatabase: Send + Sync {
  /// Look up an exact `(name, version)` pair, returning the reason it is
  /// flagged, or `None` when it is not known to be malicious.
  async fn lookup(&self, name: &str, version: &str) -> Result<Option<String>>;

  /// Whether an exact `(name, version)` pair is known malware
  async fn is_malware(&self, name: &str, version: &str) -> Result<bool> {
    Ok(self.lookup(name, version).await?.is_some())
  }
}

/// Audit a set of pending changes against the malware database.
///
/// Additions and version changes are looked up; removals are always allowed.
/// A database error aborts the audit, so callers fail closed.
pub async fn audit_changes<D>(database: &D, changes: &[PackageChange]) -> Result<AuditVerdict>
where
  D: MalwareDatabase + ?Sized,
{
  let mut verdict = AuditVerdict::default();
  for change in changes {
    let flagged = match change.change_type {
      ChangeType::Add | ChangeType::Change => database.lookup(&change.name, &change.version).await?,
      ChangeType::Remove => None,
    };
    match flagged {
      Some(reason) => verdict.disallowed_changes.push(DisallowedChange {
        change: change.clone(),
        reason,
      }),
      None => verdict.allowed_changes.push(change.clone()),
    }
  }
  Ok(verdict)
}

/// One entry of the malware feed
#[derive(Debug, Clone, Deserialize)]
struct MalwareEntry {
  package_name: String,
  version: String,
  #[serde(default)]
  reason: Option<String>,
}

/// In-memory malware database built from a JSON feed snapshot.
///
/// The feed is an array of `{"package_name", "version", "reason"}` objects.
/// Fetching and refreshing the feed is left to the caller.
#[derive(Debug, Clone, Default)]
pub struct MalwareList {
  entries: HashMap<(String, String), String>,
}

impl MalwareList {
  pub fn new() -> Self {
    Self::default()
  }

  /// Parse a feed snapshot
  pub fn from_json(json: &str) -> Result<Self> {
    let feed: Vec<MalwareEntry> = serde_json::from_str(json)
      .map_err(|e| Error::audit_error(format!("Failed to parse malware feed: {}", e)))?;
    let mut list = Self::new();
    for entry in feed {
      let reason = entry
        .reason
        .unwrap_or_else(|| DEFAULT_MALWARE_REASON.to_string());
      list.insert(entry.package_name, entry.version, reason);
    }
    Ok(list)
  }

  /// Read and parse a feed snapshot from disk
  pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let json = tokio::fs::read_to_string(path).await.map_err(|e| {
      Error::audit_error(format!(
        "Failed to read malware feed {}: {}",
        path.display(),
        e
      ))
    })?;
    Self::from_json(&json)
  }

  /// Flag an exact `(name, version)` pair
  pub fn insert(
    &mut self,
    name: impl Into<String>,
    version: impl Into<String>,
    reason: impl Into<String>,
  ) {
    self
      .entries
      .insert((name.into(), version.into()), reason.into());
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

#[async_trait::async_trait]
impl MalwareDatabase for MalwareList {
  async fn lookup(&self, name: &str, version: &str) -> Result<Option<String>> {
    Ok(
      self
        .entries
        .get(&(name.to_string(), version.to_string()))
        .cloned(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn change(name: &str, version: &str, change_type: ChangeType) -> PackageChange {
    PackageChange {
      name: name.to_string(),
      version: version.to_string(),
      change_type,
    }
  }

  fn database() -> MalwareList {
    let mut list = MalwareList::new();
    list.insert("evil-pkg", "1.0.0", "MALWARE");
    list
  }

  struct Unavailable;

  #[async_trait::async_trait]
  impl MalwareDatabase for Unavailable {
    async fn lookup(&self, _name: &str, _version: &str) -> Result<Option<String>> {
      Err(Error::audit_error("feed unavailable"))
    }
  }

  #[tokio::test]
  async fn test_exact_match_is_disallowed() {
    let changes = vec![
      change("evil-pkg", "1.0.0", ChangeType::Add),
      change("lodash", "4.17.21", ChangeType::Add),
    ];
    let verdict = audit_changes(&database(), &changes).await.unwrap();
    assert!(!verdict.is_allowed());
    assert_eq!(verdict.disallowed_changes.len(), 1);
    assert_eq!(verdict.disallowed_changes[0].change.name, "evil-pkg");
    assert_eq!(verdict.disallowed_changes[0].reason, "MALWARE");
    assert_eq!(verdict.allowed_changes, vec![changes[1].clone()]);
  }

  #[tokio::test]
  async fn test_other_version_is_allowed() {
    let changes = vec![change("evil-pkg", "1.0.1", ChangeType::Change)];
    let verdict = audit_changes(&database(), &changes).await.unwrap();
    assert!(verdict.is_allowed());
    assert_eq!(verdict.allowed_changes.len(), 1);
  }

  #[tokio::test]
  async fn test_removal_is_never_flagged() {
    let changes = vec![change("evil-pkg", "1.0.0", ChangeType::Remove)];
    let verdict = audit_changes(&database(), &changes).await.unwrap();
    assert!(verdict.is_allowed());
  }

  #[tokio::test]
  async fn test_empty_changes_are_allowed() {
    let verdict = audit_changes(&database(), &[]).await.unwrap();
    assert!(verdict.is_allowed());
    assert!(verdict.allowed_changes.is_empty());
  }

  #[tokio::test]
  async fn test_database_failure_propagates() {
    let changes = vec![change("lodash", "4.17.21", ChangeType::Add)];
    assert!(audit_changes(&Unavailable, &changes).await.is_err());
  }

  #[tokio::test]
  async fn test_feed_parsing() {
    let list = MalwareList::from_json(
      r#"[
        {"package_name": "evil-pkg", "version": "1.0.0", "reason": "MALWARE"},
        {"package_name": "bad_wheel", "version": "0.1"}
      ]"#,
    )
    .unwrap();
    assert_eq!(list.len(), 2);
    assert!(list.is_malware("evil-pkg", "1.0.0").await.unwrap());
    assert_eq!(
      list.lookup("bad_wheel", "0.1").await.unwrap().as_deref(),
      Some(DEFAULT_MALWARE_REASON)
    );
    assert!(!list.is_malware("evil-pkg", "2.0.0").await.unwrap());
  }

  #[test]
  fn test_invalid_feed_is_rejected() {
    assert!(MalwareList::from_json("{\"not\": \"a list\"}").is_err());
  }
}
