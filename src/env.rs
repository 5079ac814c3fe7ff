//! Environment variables that route a child process through the proxy

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;

pub const HTTPS_PROXY: &str = "HTTPS_PROXY";
/// Read by `global-agent`, which some package managers bootstrap
pub const GLOBAL_AGENT_HTTP_PROXY: &str = "GLOBAL_AGENT_HTTP_PROXY";
/// Extra trust anchors for Node.js clients
pub const NODE_EXTRA_CA_CERTS: &str = "NODE_EXTRA_CA_CERTS";

/// The proxy URL a child process should use
pub fn proxy_url(port: u16) -> String {
  format!("http://localhost:{}", port)
}

/// Variables redirecting a package manager through a proxy on `port` that
/// trusts the root certificate at `ca_cert_path`.
pub fn proxy_env_vars(port: u16, ca_cert_path: &Path) -> Vec<(String, String)> {
  let url = proxy_url(port);
  vec![
    (HTTPS_PROXY.to_string(), url.clone()),
    (GLOBAL_AGENT_HTTP_PROXY.to_string(), url),
    (
      NODE_EXTRA_CA_CERTS.to_string(),
      ca_cert_path.display().to_string(),
    ),
  ]
}

/// Merge proxy variables into a caller environment.
///
/// Proxy variables always win. A caller variable is copied only when its
/// upper-cased name is not a proxy variable, so `https_proxy` can not shadow
/// `HTTPS_PROXY` in clients that read either spelling.
pub fn merge_env<I, K, V>(base: I, proxy_vars: &[(String, String)]) -> HashMap<String, String>
where
  I: IntoIterator<Item = (K, V)>,
  K: Into<String>,
  V: Into<String>,
{
  let mut merged: HashMap<String, String> = proxy_vars.iter().cloned().collect();
  for (key, value) in base {
    let key = key.into();
    let shadowed = proxy_vars
      .iter()
      .any(|(proxy_key, _)| proxy_key.eq_ignore_ascii_case(&key));
    if !shadowed {
      merged.insert(key, value.into());
    }
  }
  merged
}

/// UTF-8 entries of an OS environment, e.g. `std::env::vars_os()`.
///
/// Entries whose name or value is not valid UTF-8 are skipped.
pub fn utf8_vars<I>(vars: I) -> Vec<(String, String)>
where
  I: IntoIterator<Item = (OsString, OsString)>,
{
  vars
    .into_iter()
    .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
      (Ok(key), Ok(value)) => Some((key, value)),
      (Ok(key), Err(_)) => {
        tracing::warn!("skipping {}: value is not UTF-8", key);
        None
      }
      (Err(key), _) => {
        tracing::warn!("skipping {:?}: name is not UTF-8", key);
        None
      }
    })
    .collect()
}
