//! Known package registries
//!
//! Hosts listed here are the only ones the proxy decrypts. Matching is a
//! case-insensitive substring test, so `evil-registry.npmjs.org.attacker.com`
//! matches too. Tightening this changes which hosts are intercepted.

/// npm public registry
pub const NPM_REGISTRY: &str = "registry.npmjs.org";
/// Registry mirror used by yarn
pub const YARN_REGISTRY: &str = "registry.yarnpkg.com";
/// PyPI index host
pub const PYPI_REGISTRY: &str = "pypi.org";
/// PyPI file host
pub const PYPI_FILES_REGISTRY: &str = "files.pythonhosted.org";

/// Every host the proxy intercepts
pub const KNOWN_REGISTRIES: &[&str] = &[
  NPM_REGISTRY,
  YARN_REGISTRY,
  PYPI_REGISTRY,
  PYPI_FILES_REGISTRY,
];

/// Registry family a download URL belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registry {
  /// registry.npmjs.org
  Npm,
  /// files.pythonhosted.org / pypi.org
  PyPi,
  /// registry.yarnpkg.com
  Yarn,
}

impl Registry {
  /// Classify a hostname, checking npm, then PyPI, then yarn.
  pub fn for_host(host: &str) -> Option<Registry> {
    let host = host.to_ascii_lowercase();
    if host.contains(NPM_REGISTRY) {
      Some(Registry::Npm)
    } else if host.contains(PYPI_FILES_REGISTRY) || host.contains(PYPI_REGISTRY) {
      Some(Registry::PyPi)
    } else if host.contains(YARN_REGISTRY) {
      Some(Registry::Yarn)
    } else {
      None
    }
  }
}

/// Whether CONNECT traffic to `host` should be intercepted
pub fn is_known_registry(host: &str) -> bool {
  let host = host.to_ascii_lowercase();
  KNOWN_REGISTRIES.iter().any(|registry| host.contains(registry))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_known_registries_match_case_insensitively() {
    assert!(is_known_registry("registry.npmjs.org"));
    assert!(is_known_registry("REGISTRY.NPMJS.ORG"));
    assert!(is_known_registry("registry.yarnpkg.com"));
    assert!(is_known_registry("files.pythonhosted.org"));
    assert!(is_known_registry("pypi.org"));
  }

  #[test]
  fn test_other_hosts_are_not_intercepted() {
    assert!(!is_known_registry("github.com"));
    assert!(!is_known_registry("nodejs.org"));
    assert!(!is_known_registry("127.0.0.1"));
  }

  #[test]
  fn test_substring_match_over_matches() {
    assert!(is_known_registry("evil-registry.npmjs.org.attacker.com"));
  }

  #[test]
  fn test_registry_family_priority() {
    assert_eq!(Registry::for_host("registry.npmjs.org"), Some(Registry::Npm));
    assert_eq!(
      Registry::for_host("files.pythonhosted.org"),
      Some(Registry::PyPi)
    );
    assert_eq!(Registry::for_host("pypi.org"), Some(Registry::PyPi));
    assert_eq!(
      Registry::for_host("registry.yarnpkg.com"),
      Some(Registry::Yarn)
    );
    assert_eq!(Registry::for_host("example.com"), None);
  }
}
