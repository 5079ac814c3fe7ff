//! TLS termination and policy gating for registry hosts

use crate::body::{text_response, ProxyBody};
use crate::error::{Error, Result};
use crate::io::PrefixedStream;
use crate::policy::Decision;
use crate::server::ProxyContext;
use crate::tls;
use crate::tunnel::CONNECTION_ESTABLISHED;
use crate::upstream::send_request;
use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::uri::PathAndQuery;
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// Registries are always reached on the standard HTTPS port
const UPSTREAM_HTTPS_PORT: u16 = 443;

/// Body of the 403 sent for a blocked download
pub const BLOCKED_MESSAGE: &str = "Forbidden - blocked by safe-chain";

/// Terminate TLS on `client` for `hostname` and serve its requests.
///
/// Each request is checked by the policy evaluator; allowed ones are replayed
/// over a new TLS connection to the real host. Requests on one connection are
/// answered in order, keep-alive included.
pub(crate) async fn intercept(
  mut client: TcpStream,
  pre_read: Bytes,
  hostname: String,
  ctx: ProxyContext,
) -> Result<()> {
  client.write_all(CONNECTION_ESTABLISHED).await?;
  client.flush().await?;

  let leaf = ctx.cert_manager.issue_leaf_certificate(&hostname).await?;
  let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&leaf)?));
  let tls_stream = acceptor
    .accept(PrefixedStream::new(pre_read, client))
    .await
    .map_err(|e| Error::tls_error(format!("TLS handshake for {} failed: {}", hostname, e)))?;
  tracing::debug!("[mitm] intercepting {}", hostname);

  let hostname: Arc<str> = hostname.into();
  let service = service_fn(move |request: Request<Incoming>| {
    let ctx = ctx.clone();
    let hostname = hostname.clone();
    async move { Ok::<_, Infallible>(handle_request(request, &hostname, &ctx).await) }
  });

  http1::Builder::new()
    .preserve_header_case(true)
    .title_case_headers(true)
    .serve_connection(TokioIo::new(tls_stream), service)
    .await?;
  Ok(())
}

async fn handle_request(
  request: Request<Incoming>,
  hostname: &str,
  ctx: &ProxyContext,
) -> Response<ProxyBody> {
  let path = request
    .uri()
    .path_and_query()
    .map(PathAndQuery::as_str)
    .unwrap_or("/");
  let url = format!("https://{}{}", hostname, path);

  match ctx.policy.evaluate(&url).await {
    Ok(Decision::Allow) => {}
    Ok(Decision::Block { .. }) => {
      return text_response(StatusCode::FORBIDDEN, BLOCKED_MESSAGE);
    }
    Err(e) => {
      tracing::warn!("[mitm] refusing {}, audit failed: {}", url, e);
      return text_response(
        StatusCode::BAD_GATEWAY,
        format!("Bad Gateway - unable to audit {}: {}", url, e),
      );
    }
  }

  match forward(request, hostname, ctx).await {
    Ok(response) => response,
    Err(e) => {
      tracing::debug!("[mitm] upstream {} failed: {}", hostname, e);
      text_response(
        StatusCode::BAD_GATEWAY,
        format!("Bad Gateway - {}: {}", hostname, e),
      )
    }
  }
}

/// Replay `request` to the real host and stream the response back
async fn forward(
  request: Request<Incoming>,
  hostname: &str,
  ctx: &ProxyContext,
) -> Result<Response<ProxyBody>> {
  let (mut parts, body) = request.into_parts();
  let origin_form = parts
    .uri
    .path_and_query()
    .cloned()
    .unwrap_or_else(|| PathAndQuery::from_static("/"));
  parts.uri = Uri::from(origin_form);
  parts.version = Version::HTTP_11;
  // The client's Host names the intercepted connection; the new one names
  // the registry itself.
  parts.headers.remove(HOST);
  let host = HeaderValue::from_str(hostname)
    .map_err(|e| Error::invalid_request(format!("Invalid host {}: {}", hostname, e)))?;
  parts.headers.insert(HOST, host);

  let stream = ctx.upstream.connect_tls(hostname, UPSTREAM_HTTPS_PORT).await?;
  let response = send_request(stream, Request::from_parts(parts, body)).await?;
  tracing::debug!("[mitm] {} answered {}", hostname, response.status());
  Ok(response.map(|body| body.boxed()))
}
