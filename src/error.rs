//! Error types for the interception proxy

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate error
  #[error("Certificate error: {0}")]
  CertificateError(String),

  /// TLS error
  #[error("TLS error: {0}")]
  TlsError(String),

  /// HTTP protocol error on a client or upstream connection
  #[error("Hyper error: {0}")]
  HyperError(hyper::Error),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Connection error
  #[error("Connection error: {0}")]
  ConnectionError(String),

  /// The malware audit could not produce a verdict
  #[error("Audit error: {0}")]
  AuditError(String),

  /// Invalid configuration
  #[error("Config error: {0}")]
  ConfigError(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::CertificateError(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  ///
  /// Handshake failures are routine (a client that does not trust the root),
  /// so these are logged at debug level.
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::TlsError(msg.into());
    tracing::debug!("TLS error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("Invalid request: {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::ConnectionError(msg.into());
    tracing::debug!("Connection error: {}", error);
    error
  }

  /// Create an audit error and log it
  pub fn audit_error(msg: impl Into<String>) -> Self {
    let error = Error::AuditError(msg.into());
    tracing::error!("Audit error: {}", error);
    error
  }

  /// Create a config error and log it
  pub fn config_error(msg: impl Into<String>) -> Self {
    let error = Error::ConfigError(msg.into());
    tracing::error!("Config error: {}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("IO error: {}", error);
    error
  }
}

impl From<hyper::Error> for Error {
  fn from(value: hyper::Error) -> Self {
    let error = Error::HyperError(value);
    tracing::debug!("Hyper error: {}", error);
    error
  }
}
