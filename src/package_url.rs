//! Package reference extraction from registry download URLs

use crate::registry::Registry;
use http::Uri;
use percent_encoding::percent_decode_str;
use std::fmt;

/// Source distribution suffixes accepted on PyPI hosts
const SDIST_EXTENSIONS: &[&str] = &[".tar.gz", ".zip", ".tar.bz2", ".tar.xz"];

/// A package name and exact version resolved from an artifact URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageReference {
  /// Package name, including an npm scope when present
  pub name: String,
  /// Exact version
  pub version: String,
}

impl PackageReference {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
    }
  }
}

impl fmt::Display for PackageReference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.name, self.version)
  }
}

/// Resolve the package a download URL points at.
///
/// Returns `None` for anything that is not an artifact download on a known
/// registry: index pages, metadata documents, unknown hosts.
///
/// ```
/// use safe_chain_proxy::parse_package_from_url;
///
/// let pkg = parse_package_from_url("https://registry.npmjs.org/@babel/core/-/core-7.21.4.tgz").unwrap();
/// assert_eq!(pkg.name, "@babel/core");
/// assert_eq!(pkg.version, "7.21.4");
/// assert!(parse_package_from_url("https://registry.npmjs.org/lodash").is_none());
/// ```
pub fn parse_package_from_url(url: &str) -> Option<PackageReference> {
  let uri: Uri = url.parse().ok()?;
  let host = uri.host()?;
  match Registry::for_host(host)? {
    Registry::Npm | Registry::Yarn => parse_tarball_path(uri.path()),
    Registry::PyPi => parse_python_artifact_path(uri.path()),
  }
}

/// `/<name>/-/<unscoped name>-<version>.tgz`
fn parse_tarball_path(path: &str) -> Option<PackageReference> {
  let path = path.trim_start_matches('/');
  let path = path.strip_suffix(".tgz")?;
  let (raw_name, filename) = path.split_once("/-/")?;
  let name = percent_decode_str(raw_name).decode_utf8().ok()?;
  if name.is_empty() {
    return None;
  }
  let unscoped = name.rsplit('/').next().unwrap_or(&name);
  // The filename is `<unscoped>-<version>`; the prefix is skipped by length.
  let version = filename.get(unscoped.len() + 1..)?;
  if version.is_empty() {
    return None;
  }
  Some(PackageReference::new(name.into_owned(), version))
}

fn parse_python_artifact_path(path: &str) -> Option<PackageReference> {
  let last_segment = path.rsplit('/').next()?;
  let filename = percent_decode_str(last_segment).decode_utf8().ok()?;

  if let Some(stem) = filename.strip_suffix(".whl") {
    // <name>-<version>(-<build>)?-<python>-<abi>-<platform>
    let mut tokens = stem.split('-');
    let name = tokens.next()?;
    let version = tokens.next()?;
    return python_reference(name, version);
  }

  let stem = SDIST_EXTENSIONS
    .iter()
    .find_map(|extension| filename.strip_suffix(extension))?;
  let (name, version) = stem.rsplit_once('-')?;
  python_reference(name, version)
}

fn python_reference(name: &str, version: &str) -> Option<PackageReference> {
  if name.is_empty() || version.is_empty() || version == "latest" {
    return None;
  }
  Some(PackageReference::new(name, version))
}
