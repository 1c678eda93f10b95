//! Request translation and the relay service.
//!
//! Every inbound request is rebuilt against the fixed upstream configured at
//! startup. The target URL is the upstream base with the inbound path and
//! query appended as `{base}{path}?{query}`; the `?` is always present, even
//! when the query is empty, so the upstream sees exactly the separator the
//! signing scheme was built around. Method and headers carry over and the
//! body is streamed without buffering. On the return path the upstream's
//! status and body are relayed verbatim; its response headers are not.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use http::Uri;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::Incoming;
use hyper::{Request, Response};
use tower::Service;
use tracing::{debug, info};

use crate::error::{ProxyError, ProxyResult};
use crate::signer::EnvelopeSigner;
use crate::upstream::{OutboundBody, RelayBody, UpstreamTransport};

/// Build the target URL for an inbound request URI.
///
/// The upstream base is prepended verbatim; no slash normalization or path
/// rewriting happens here. A base that does not parse into a URI together
/// with the inbound path fails translation.
pub fn target_uri(upstream: &str, inbound: &Uri) -> ProxyResult<Uri> {
    let path = inbound.path();
    let query = inbound.query().unwrap_or("");
    let target = format!("{upstream}{path}?{query}");
    target.parse().map_err(|e| {
        ProxyError::Translation(format!("Failed to parse target URL {target:?}: {e}"))
    })
}

/// Rebuild an inbound request against the upstream base.
///
/// The method is carried over unchanged and the headers are copied into an
/// independent map, so later mutation of the outbound request never touches
/// the inbound one. `Host` is dropped from the copy; the inbound value names
/// this proxy, and the client derives the right one from the target URL.
pub fn translate<T>(
    parts: http::request::Parts,
    upstream: &str,
    body: T,
) -> ProxyResult<Request<T>> {
    let target = target_uri(upstream, &parts.uri)?;

    let mut headers = parts.headers.clone();
    headers.remove(http::header::HOST);

    let mut outbound = Request::builder()
        .method(parts.method)
        .uri(target)
        .body(body)
        .map_err(|e| ProxyError::Translation(format!("Failed to build upstream request: {e}")))?;
    *outbound.headers_mut() = headers;

    Ok(outbound)
}

/// The relay pipeline: translate, sign, dispatch.
///
/// Holds everything a request needs as shared immutable state, so clones are
/// cheap and every connection task can carry its own copy.
#[derive(Clone)]
pub struct RelayService {
    upstream: Arc<str>,
    signer: EnvelopeSigner,
    transport: Arc<dyn UpstreamTransport>,
}

impl RelayService {
    pub fn new(
        upstream: String,
        signer: EnvelopeSigner,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Self {
        Self {
            upstream: upstream.into(),
            signer,
            transport,
        }
    }

    /// Relay one request to the upstream and stream the response back.
    ///
    /// Generic over the inbound body so tests can drive the full pipeline
    /// with buffered bodies while the server hands in `Incoming`.
    pub async fn handle<B>(&self, req: Request<B>) -> ProxyResult<Response<RelayBody>>
    where
        B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        info!(
            method = %req.method(),
            path = req.uri().path(),
            query = req.uri().query().unwrap_or(""),
            "Relaying request"
        );

        let (parts, body) = req.into_parts();

        // Stream the inbound body through without buffering.
        let body_stream = BodyStream::new(body);
        let mapped_stream = body_stream.map(|result| {
            result.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
        });
        let stream_body = StreamBody::new(mapped_stream);
        let outbound_body: OutboundBody = BodyExt::boxed(stream_body);

        let mut outbound = translate(parts, &self.upstream, outbound_body)?;
        self.signer.sign(outbound.headers_mut());

        debug!(target = %outbound.uri(), "Dispatching upstream");
        let upstream_res = self.transport.send(outbound).await?;

        // Only the status code and body are copied back to the caller;
        // upstream response headers are not translated on the return path.
        let (parts, body) = upstream_res.into_parts();
        let mut response = Response::new(body);
        *response.status_mut() = parts.status;
        Ok(response)
    }
}

impl Service<Request<Incoming>> for RelayService {
    type Response = Response<RelayBody>;
    type Error = ProxyError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.handle(req).await })
    }
}
