//! # safe-chain-proxy
//!
//! A local forward proxy that sits between a package manager and the
//! internet and refuses to download packages known to be malicious.
//!
//! - `CONNECT` requests to package registries (npm, yarn, PyPI) are
//!   intercepted: TLS is terminated with a certificate issued by a local
//!   root CA, each request URL is mapped to a package name and version and
//!   audited before anything is fetched.
//! - `CONNECT` requests to every other host are tunnelled byte for byte.
//! - Plain `http://` proxy requests are forwarded and streamed back.
//!
//! Blocked downloads get `403 Forbidden` and are collected for an
//! end-of-session report.
//!
//! ## Running a session
//!
//! ```no_run
//! use safe_chain_proxy::{MalwareList, ProxyConfig, ProxySession};
//! use std::sync::Arc;
//!
//! # async fn run() -> safe_chain_proxy::Result<()> {
//! let malware = MalwareList::from_json(
//!   r#"[{"package_name": "evil-pkg", "version": "1.0.0", "reason": "MALWARE"}]"#,
//! )?;
//! let mut session = ProxySession::start(ProxyConfig::from_env(), Arc::new(malware)).await?;
//! for (key, value) in session.env_vars() {
//!   println!("{key}={value}");
//! }
//! // ... run the package manager ...
//! session.stop().await;
//! if !session.verify_no_malicious_packages() {
//!   std::process::exit(1);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Package URLs
//!
//! ```rust
//! use safe_chain_proxy::parse_package_from_url;
//!
//! let package = parse_package_from_url("https://registry.npmjs.org/lodash/-/lodash-4.17.21.tgz").unwrap();
//! assert_eq!(package.to_string(), "lodash@4.17.21");
//! ```

/// Malware audit gate
pub mod audit;
mod body;
/// Root CA and per-host leaf certificates
pub mod ca;
mod config;
/// Child process environment
pub mod env;
mod error;
mod io;
mod mitm;
mod package_url;
mod policy;
/// Package registries that are intercepted
pub mod registry;
mod server;
mod session;
mod tls;
mod tunnel;
mod upstream;

pub use audit::{MalwareDatabase, MalwareList};
pub use ca::{CertificateAuthority, CertificateManager, LeafCertificate};
pub use config::{default_ca_storage_path, ProxyConfig, DEFAULT_SHUTDOWN_GRACE};
pub use error::{Error, Result};
pub use io::PrefixedStream;
pub use mitm::BLOCKED_MESSAGE;
pub use package_url::{parse_package_from_url, PackageReference};
pub use policy::{AuditPolicy, Decision, PolicyEvaluator};
pub use server::ProxyServer;
pub use session::{render_report, BlockedDownload, BlockedDownloads, ProxySession, EXIT_MESSAGE};
pub use upstream::{Upstream, UpstreamProxy, UPSTREAM_PROXY_ENV};
