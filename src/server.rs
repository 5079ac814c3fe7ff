//! Proxy front-end: accepts CONNECT and direct HTTP proxy requests

use crate::body::{text_response, ProxyBody};
use crate::ca::CertificateManager;
use crate::error::{Error, Result};
use crate::io::PrefixedStream;
use crate::mitm;
use crate::policy::PolicyEvaluator;
use crate::registry::is_known_registry;
use crate::tunnel::{self, BAD_GATEWAY};
use crate::upstream::{parse_host_port, send_request, trim_brackets, Upstream};
use bytes::{Bytes, BytesMut};
use http::header::{HeaderValue, HOST};
use http::uri::{Authority, PathAndQuery};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Maximum size of a request head read before routing
const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Default CONNECT port
const DEFAULT_TLS_PORT: u16 = 443;
/// Hop-by-hop proxy headers that are not forwarded to origins
const PROXY_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

/// State shared by every connection of one proxy instance
#[derive(Clone)]
pub(crate) struct ProxyContext {
  pub(crate) cert_manager: Arc<CertificateManager>,
  pub(crate) policy: Arc<dyn PolicyEvaluator>,
  pub(crate) upstream: Upstream,
}

/// A running proxy listener
pub struct ProxyServer {
  local_addr: SocketAddr,
  shutdown: watch::Sender<bool>,
  task: Option<JoinHandle<()>>,
}

impl ProxyServer {
  /// Bind `addr` and start accepting connections in the background.
  ///
  /// When `addr` is IPv4 loopback the same port is also bound on `[::1]`, so
  /// clients resolving `localhost` to IPv6 reach the proxy; that second
  /// listener is skipped when IPv6 is unavailable. A bind failure on `addr`
  /// is returned; everything after that is handled per connection.
  pub(crate) async fn start(
    addr: SocketAddr,
    ctx: ProxyContext,
    shutdown_grace: Duration,
  ) -> Result<Self> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::connection_error(format!("Failed to bind to {}: {}", addr, e)))?;
    let local_addr = listener.local_addr()?;
    let loopback_v6 = if local_addr.ip() == IpAddr::V4(Ipv4Addr::LOCALHOST) {
      let v6_addr = SocketAddr::from((Ipv6Addr::LOCALHOST, local_addr.port()));
      match TcpListener::bind(v6_addr).await {
        Ok(listener) => Some(listener),
        Err(e) => {
          tracing::debug!("[proxy] not listening on {}: {}", v6_addr, e);
          None
        }
      }
    } else {
      None
    };
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(Self::run(
      listener,
      loopback_v6,
      ctx,
      shutdown_rx,
      shutdown_grace,
    ));
    tracing::info!("[proxy] listening on {}", local_addr);
    Ok(Self {
      local_addr,
      shutdown,
      task: Some(task),
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stop accepting, give open connections the grace period, then drop
  /// whatever is left. Calling it again is a no-op.
  pub async fn stop(&mut self) {
    let _ = self.shutdown.send(true);
    if let Some(task) = self.task.take() {
      if let Err(e) = task.await {
        tracing::error!("[proxy] accept loop failed: {}", e);
      }
      tracing::info!("[proxy] stopped {}", self.local_addr);
    }
  }

  async fn run(
    listener: TcpListener,
    loopback_v6: Option<TcpListener>,
    ctx: ProxyContext,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
  ) {
    let mut connections = JoinSet::new();
    loop {
      let accepted = tokio::select! {
        // A dropped sender counts as a stop request too
        _ = shutdown.changed() => break,
        accepted = listener.accept() => accepted,
        accepted = accept_on(loopback_v6.as_ref()) => accepted,
        Some(_) = connections.join_next(), if !connections.is_empty() => continue,
      };
      match accepted {
        Ok((stream, peer_addr)) => {
          let ctx = ctx.clone();
          connections.spawn(async move {
            if let Err(e) = Self::handle_connection(stream, peer_addr, ctx).await {
              tracing::debug!("[proxy] connection from {} ended: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("[proxy] Failed to accept connection: {}", e);
        }
      }
    }
    drop(loopback_v6);
    drop(listener);

    let drained = tokio::time::timeout(grace, async {
      while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
      tracing::debug!(
        "[proxy] dropping {} connections after grace period",
        connections.len()
      );
      connections.abort_all();
    }
  }

  /// Route one client connection by its first request head
  async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: ProxyContext,
  ) -> Result<()> {
    let Some(head) = read_request_head(&mut stream).await? else {
      return Ok(());
    };
    let (method, target) = head.request_line()?;
    tracing::debug!("[proxy] {} {} from {}", method, target, peer_addr);

    if method.eq_ignore_ascii_case("CONNECT") {
      let (host, port) = match parse_host_port(&target, DEFAULT_TLS_PORT) {
        Ok(host_port) => host_port,
        Err(e) => {
          stream.write_all(BAD_GATEWAY).await?;
          return Err(e);
        }
      };
      if is_known_registry(&host) {
        mitm::intercept(stream, head.remainder(), host, ctx).await
      } else {
        tunnel::tunnel(stream, head.remainder(), &host, port, &ctx.upstream).await
      }
    } else {
      Self::serve_plain(PrefixedStream::new(head.into_bytes(), stream), ctx).await
    }
  }

  /// Serve direct (absolute-URI) proxy requests on a connection
  async fn serve_plain(stream: PrefixedStream<TcpStream>, ctx: ProxyContext) -> Result<()> {
    let service = service_fn(move |request: Request<Incoming>| {
      let upstream = ctx.upstream.clone();
      async move { Ok::<_, Infallible>(forward_plain(request, &upstream).await) }
    });
    http1::Builder::new()
      .preserve_header_case(true)
      .title_case_headers(true)
      .serve_connection(TokioIo::new(stream), service)
      .await?;
    Ok(())
  }
}

impl Drop for ProxyServer {
  fn drop(&mut self) {
    let _ = self.shutdown.send(true);
  }
}

/// Accept on an optional listener; pending forever when there is none
async fn accept_on(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
  match listener {
    Some(listener) => listener.accept().await,
    None => std::future::pending().await,
  }
}

/// Bytes read up to and past the end of the first request head
struct RequestHead {
  buffer: Bytes,
  head_len: usize,
}

impl RequestHead {
  /// Method and request target from the request line
  fn request_line(&self) -> Result<(String, String)> {
    let head = String::from_utf8_lossy(&self.buffer[..self.head_len]);
    let line = head.lines().next().unwrap_or_default();
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
      return Err(Error::invalid_request(format!("Invalid request line: {}", line)));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
  }

  /// Bytes the client sent after the head
  fn remainder(&self) -> Bytes {
    self.buffer.slice(self.head_len..)
  }

  /// Everything read so far, head included
  fn into_bytes(self) -> Bytes {
    self.buffer
  }
}

/// Read until the end of the first request head. `None` when the client
/// closes before sending anything.
async fn read_request_head(stream: &mut TcpStream) -> Result<Option<RequestHead>> {
  let mut buffer = BytesMut::with_capacity(4096);
  loop {
    if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
      return Ok(Some(RequestHead {
        buffer: buffer.freeze(),
        head_len: pos + 4,
      }));
    }
    if buffer.len() > MAX_HEAD_SIZE {
      return Err(Error::invalid_request(
        "Request head exceeds maximum allowed size",
      ));
    }
    if stream.read_buf(&mut buffer).await? == 0 {
      if buffer.is_empty() {
        return Ok(None);
      }
      return Err(Error::invalid_request("Connection closed inside request head"));
    }
  }
}

/// Forward a direct proxy request and stream the response back.
///
/// `http:` is the expected scheme; `https:` URLs sent without CONNECT are
/// fetched over TLS. Anything else, and any connection failure, is a 502.
async fn forward_plain(request: Request<Incoming>, upstream: &Upstream) -> Response<ProxyBody> {
  let scheme = request
    .uri()
    .scheme_str()
    .unwrap_or("http")
    .to_ascii_lowercase();
  if scheme != "http" && scheme != "https" {
    return text_response(
      StatusCode::BAD_GATEWAY,
      format!("Bad Gateway - unsupported protocol: {}", scheme),
    );
  }
  if request.method() == Method::CONNECT {
    return text_response(
      StatusCode::BAD_GATEWAY,
      "Bad Gateway - CONNECT must open a new connection",
    );
  }

  let secure = scheme == "https";
  let default_port = if secure { 443 } else { 80 };
  let authority = match target_authority(&request) {
    Some(authority) => authority,
    None => {
      return text_response(
        StatusCode::BAD_GATEWAY,
        "Bad Gateway - request does not name a host",
      )
    }
  };
  let host = trim_brackets(authority.host()).to_string();
  let port = authority.port_u16().unwrap_or(default_port);

  let (mut parts, body) = request.into_parts();
  let origin_form = parts
    .uri
    .path_and_query()
    .cloned()
    .unwrap_or_else(|| PathAndQuery::from_static("/"));
  parts.uri = Uri::from(origin_form);
  for name in PROXY_HEADERS {
    parts.headers.remove(*name);
  }
  if !parts.headers.contains_key(HOST) {
    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
      parts.headers.insert(HOST, value);
    }
  }
  let request = Request::from_parts(parts, body);

  let result = if secure {
    match upstream.connect_tls(&host, port).await {
      Ok(stream) => send_request(stream, request).await,
      Err(e) => Err(e),
    }
  } else {
    match upstream.connect_tcp(&host, port).await {
      Ok(stream) => send_request(stream, request).await,
      Err(e) => Err(e),
    }
  };

  match result {
    Ok(response) => response.map(|body| body.boxed()),
    Err(e) => {
      tracing::debug!("[proxy] {}:{} failed: {}", host, port, e);
      text_response(
        StatusCode::BAD_GATEWAY,
        format!("Bad Gateway - {}:{}: {}", host, port, e),
      )
    }
  }
}

/// The request's declared target: the absolute URI, else the Host header
fn target_authority(request: &Request<Incoming>) -> Option<Authority> {
  if let Some(authority) = request.uri().authority() {
    return Some(authority.clone());
  }
  request
    .headers()
    .get(HOST)?
    .to_str()
    .ok()?
    .parse::<Authority>()
    .ok()
}
