//! Upstream dispatch.
//!
//! [`UpstreamTransport`] is the seam between the relay pipeline and the wire.
//! Production traffic goes through [`HttpTransport`], a pooled hyper client
//! with TLS support; tests substitute stubs to drive the pipeline without a
//! network.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use tracing::warn;

use crate::error::{ProxyError, ProxyResult};

/// Body type for requests handed to the transport.
pub type OutboundBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Body type for responses streamed back through the relay.
pub type RelayBody = http_body_util::combinators::BoxBody<Bytes, ProxyError>;

/// One-shot dispatch of a fully prepared request to the upstream.
///
/// Implementations must not retry: the caller signed the request with a
/// timestamp, and whether a replay is acceptable is the upstream's call, not
/// the proxy's.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, req: Request<OutboundBody>) -> ProxyResult<Response<RelayBody>>;
}

/// HTTPS-capable transport over a pooled hyper client.
pub struct HttpTransport {
    client: Client<HttpsConnector<HttpConnector>, OutboundBody>,
}

impl HttpTransport {
    /// Build the shared client.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Upstream` if:
    /// - TLS crypto provider installation fails
    /// - Native TLS root certificates cannot be loaded
    pub fn new() -> ProxyResult<Self> {
        // Install default crypto provider for rustls (required for TLS to work).
        // Uses OnceLock to ensure this is called exactly once and the result
        // is captured for error reporting without panicking.
        static RUSTLS_INIT: std::sync::OnceLock<Result<(), ()>> = std::sync::OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init_result.is_err() {
            return Err(ProxyError::Upstream(
                "Failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(true);

        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| ProxyError::Upstream(format!("Failed to load native TLS roots: {e}")))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        // Title-case and preserved header casing keep the envelope headers on
        // the wire exactly as documented for the upstream's verifier.
        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .http1_title_case_headers(true)
            .http2_keep_alive_while_idle(true)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build(https_connector);

        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(&self, req: Request<OutboundBody>) -> ProxyResult<Response<RelayBody>> {
        let upstream_res = self
            .client
            .request(req)
            .await
            .map_err(classify_transport_error)?;

        // Stream the response body straight back. A failure from here on can
        // only be logged; the status line has already been relayed. Dropping
        // the body returns the pooled connection either way.
        let (parts, body) = upstream_res.into_parts();
        let body_stream = BodyStream::new(body);
        let mapped_stream = body_stream.map(|result| {
            result.map_err(|e| {
                warn!(error = %e, "Upstream body failed mid-stream");
                ProxyError::Relay(format!("Body stream error: {e}"))
            })
        });
        let stream_body = StreamBody::new(mapped_stream);
        let boxed_body: RelayBody = BodyExt::boxed(stream_body);

        Ok(Response::from_parts(parts, boxed_body))
    }
}

/// Bucket a transport error message for the log.
fn transport_error_kind(message: &str) -> &'static str {
    if message.contains("connection refused") {
        "refused"
    } else if message.contains("timeout") || message.contains("timed out") {
        "timeout"
    } else if message.contains("closed") || message.contains("canceled") || message.contains("reset")
    {
        "reset"
    } else {
        "other"
    }
}

/// Map hyper client errors into `ProxyError::Upstream`.
///
/// Every transport failure relays as 502; the kind bucket only feeds the log.
fn classify_transport_error(e: hyper_util::client::legacy::Error) -> ProxyError {
    // The interesting detail (refused, reset, timed out) sits in the source
    // chain, not in the top-level Display.
    let mut message = e.to_string();
    let mut source = std::error::Error::source(&e);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    let kind = transport_error_kind(&message.to_lowercase());
    warn!(error = %message, kind, "Upstream dispatch failed");
    ProxyError::Upstream(format!("{kind}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use http_body_util::Full;

    #[test]
    fn transport_error_kinds() {
        assert_eq!(transport_error_kind("connection refused"), "refused");
        assert_eq!(transport_error_kind("operation timed out"), "timeout");
        assert_eq!(transport_error_kind("connection reset by peer"), "reset");
        assert_eq!(transport_error_kind("channel closed"), "reset");
        assert_eq!(transport_error_kind("something else entirely"), "other");
    }

    #[test]
    fn transport_constructs() {
        assert!(HttpTransport::new().is_ok());
    }

    #[tokio::test]
    async fn unreachable_upstream_is_an_upstream_error() {
        // Bind an ephemeral port, then drop the listener so nothing is there.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let transport = HttpTransport::new().expect("transport");
        let req = Request::builder()
            .uri(format!("http://127.0.0.1:{port}/ping?"))
            .body(Full::new(Bytes::new()).map_err(|e| match e {}).boxed())
            .expect("test request");

        let err = transport.send(req).await.expect_err("should fail");
        assert!(matches!(err, ProxyError::Upstream(_)));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
