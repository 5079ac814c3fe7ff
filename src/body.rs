//! Response bodies produced by the proxy

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};

/// Body type of every response the proxy writes to a client: either a
/// streamed upstream body or a short generated message.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A complete in-memory body
pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
  Full::new(chunk.into())
    .map_err(|never| match never {})
    .boxed()
}

/// A plain-text response generated by the proxy itself
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
  let mut response = Response::new(full(message.into()));
  *response.status_mut() = status;
  response.headers_mut().insert(
    CONTENT_TYPE,
    HeaderValue::from_static("text/plain; charset=utf-8"),
  );
  response
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_text_response() {
    let response = text_response(StatusCode::FORBIDDEN, "blocked");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
      response.headers()[CONTENT_TYPE],
      "text/plain; charset=utf-8"
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"blocked");
  }
}
