//! Outbound connections: direct, or tunnelled through an upstream proxy

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::tls;
use base64::prelude::{Engine, BASE64_STANDARD};
use bytes::BytesMut;
use http::uri::Authority;
use http::{HeaderValue, Request, Response, Uri};
use hyper::body::{Body, Incoming};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Environment variables naming an upstream HTTPS proxy, in lookup order
pub const UPSTREAM_PROXY_ENV: &[&str] = &["HTTPS_PROXY", "https_proxy"];

/// Maximum size of an upstream proxy's CONNECT response head
const MAX_CONNECT_RESPONSE: usize = 16 * 1024;

/// An HTTP proxy that outbound TLS connections are tunnelled through
#[derive(Clone, Debug)]
pub struct UpstreamProxy {
  host: String,
  port: u16,
  auth: Option<HeaderValue>,
}

impl UpstreamProxy {
  /// Parse `http://[user:pass@]host[:port]`. A bare `host:port` is read as
  /// `http://host:port`.
  pub fn parse(url: &str) -> Result<Self> {
    let url = url.trim();
    let with_scheme = if url.contains("://") {
      url.to_string()
    } else {
      format!("http://{}", url)
    };
    let uri: Uri = with_scheme
      .parse()
      .map_err(|e| Error::config_error(format!("Invalid upstream proxy {}: {}", url, e)))?;
    let default_port = match uri.scheme_str() {
      Some("http") => 80,
      Some("https") => 443,
      other => {
        return Err(Error::config_error(format!(
          "Unsupported upstream proxy scheme: {}",
          other.unwrap_or_default()
        )))
      }
    };
    let authority = uri
      .authority()
      .ok_or_else(|| Error::config_error(format!("Upstream proxy has no host: {}", url)))?;
    let host = trim_brackets(authority.host()).to_string();
    let port = authority.port_u16().unwrap_or(default_port);
    let auth = match authority.as_str().rsplit_once('@') {
      Some((userinfo, _)) => Some(basic_auth(userinfo)?),
      None => None,
    };
    Ok(Self {
      host,
      port,
      auth,
    })
  }

  /// The first upstream proxy named in the environment, if any
  pub fn from_env() -> Option<Self> {
    let (name, value) = UPSTREAM_PROXY_ENV.iter().find_map(|name| {
      std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| (*name, value))
    })?;
    match Self::parse(&value) {
      Ok(proxy) => {
        tracing::debug!("[upstream] chaining through {} from {}", proxy.host, name);
        Some(proxy)
      }
      Err(e) => {
        tracing::warn!("[upstream] ignoring {}: {}", name, e);
        None
      }
    }
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  /// CONNECT request head for `host_port`
  fn connect_request(&self, host_port: &str) -> Vec<u8> {
    let mut raw = format!(
      "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: Keep-Alive\r\n",
      host_port
    )
    .into_bytes();
    if let Some(auth) = &self.auth {
      raw.extend_from_slice(b"Proxy-Authorization: ");
      raw.extend_from_slice(auth.as_bytes());
      raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw
  }
}

fn basic_auth(userinfo: &str) -> Result<HeaderValue> {
  let (user, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
  let user = percent_decode_str(user).decode_utf8_lossy();
  let password = percent_decode_str(password).decode_utf8_lossy();
  let encoded = BASE64_STANDARD.encode(format!("{}:{}", user, password));
  let mut header = HeaderValue::from_str(&format!("Basic {}", encoded))
    .map_err(|e| Error::config_error(format!("Invalid proxy credentials: {}", e)))?;
  header.set_sensitive(true);
  Ok(header)
}

pub(crate) fn trim_brackets(host: &str) -> &str {
  host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host)
}

/// Split a `host[:port]` authority, using `default_port` when absent.
pub(crate) fn parse_host_port(target: &str, default_port: u16) -> Result<(String, u16)> {
  let authority: Authority = target
    .parse()
    .map_err(|_| Error::invalid_request(format!("Invalid target: {}", target)))?;
  if authority.as_str().contains('@') {
    return Err(Error::invalid_request(format!("Invalid target: {}", target)));
  }
  let host = trim_brackets(authority.host());
  if host.is_empty() {
    return Err(Error::invalid_request(format!("Invalid target: {}", target)));
  }
  // A port section that is present must be a valid u16
  let has_port = authority
    .as_str()
    .rsplit_once(':')
    .is_some_and(|(_, tail)| !tail.contains(']'));
  let port = match authority.port_u16() {
    Some(port) => port,
    None if has_port => {
      return Err(Error::invalid_request(format!("Invalid port in target: {}", target)))
    }
    None => default_port,
  };
  Ok((host.to_string(), port))
}

/// Opens outbound connections for the proxy
#[derive(Clone)]
pub struct Upstream {
  proxy: Option<UpstreamProxy>,
  tls: TlsConnector,
  resolve_overrides: Arc<HashMap<String, SocketAddr>>,
}

impl Upstream {
  pub fn new(config: &ProxyConfig) -> Result<Self> {
    let client_config = tls::client_config(&config.extra_root_certs)?;
    let resolve_overrides = config
      .resolve_overrides
      .iter()
      .map(|(host, addr)| (host.to_ascii_lowercase(), *addr))
      .collect();
    Ok(Self {
      proxy: config.upstream_proxy.clone(),
      tls: TlsConnector::from(Arc::new(client_config)),
      resolve_overrides: Arc::new(resolve_overrides),
    })
  }

  /// Direct TCP connection, honoring resolve overrides
  pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
    let stream = match self.resolve_overrides.get(&host.to_ascii_lowercase()) {
      Some(addr) => TcpStream::connect(addr).await,
      None => TcpStream::connect((host, port)).await,
    }
    .map_err(|e| Error::connection_error(format!("Failed to connect to {}:{}: {}", host, port, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
  }

  /// TLS connection to `host:port`, through the upstream proxy when one is
  /// configured.
  pub async fn connect_tls(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
    let stream = match &self.proxy {
      Some(proxy) => self.connect_via_proxy(proxy, host, port).await?,
      None => self.connect_tcp(host, port).await?,
    };
    let server_name = ServerName::try_from(host.to_string())
      .map_err(|e| Error::tls_error(format!("Invalid server name {}: {}", host, e)))?;
    self
      .tls
      .connect(server_name, stream)
      .await
      .map_err(|e| Error::tls_error(format!("TLS handshake with {} failed: {}", host, e)))
  }

  async fn connect_via_proxy(
    &self,
    proxy: &UpstreamProxy,
    host: &str,
    port: u16,
  ) -> Result<TcpStream> {
    let mut stream = self.connect_tcp(&proxy.host, proxy.port).await?;
    let host_port = if host.contains(':') {
      format!("[{}]:{}", host, port)
    } else {
      format!("{}:{}", host, port)
    };
    stream.write_all(&proxy.connect_request(&host_port)).await?;
    stream.flush().await?;

    let head = read_connect_response(&mut stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
      return Err(Error::connection_error(format!(
        "Upstream proxy {} refused CONNECT {}: {}",
        proxy.host, host_port, status_line
      )));
    }
    Ok(stream)
  }
}

/// Read a CONNECT response head without consuming bytes past it, so the
/// TLS handshake starts on a clean stream.
async fn read_connect_response<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
  let mut head = BytesMut::with_capacity(256);
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    if stream.read(&mut byte).await? == 0 {
      return Err(Error::connection_error(
        "Upstream proxy closed during CONNECT",
      ));
    }
    head.extend_from_slice(&byte);
    if head.len() > MAX_CONNECT_RESPONSE {
      return Err(Error::connection_error(
        "Upstream proxy CONNECT response too large",
      ));
    }
  }
  Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Send one request over a fresh HTTP/1.1 connection on `io`.
///
/// The response body streams from the connection; the connection task ends
/// once the body is consumed or dropped.
pub async fn send_request<T, B>(io: T, request: Request<B>) -> Result<Response<Incoming>>
where
  T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  B: Body + Send + 'static,
  B::Data: Send,
  B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
  let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
    .preserve_header_case(true)
    .title_case_headers(true)
    .handshake(TokioIo::new(io))
    .await?;
  tokio::spawn(async move {
    if let Err(e) = conn.await {
      tracing::debug!("[upstream] connection closed: {}", e);
    }
  });
  Ok(sender.send_request(request).await?)
}
