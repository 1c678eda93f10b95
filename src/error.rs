//! Error types for the signgate relay path.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors that can occur while relaying a request to the upstream.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The outbound request could not be constructed from the inbound one
    /// (maps to 500 Internal Server Error)
    #[error("Translation failed: {0}")]
    Translation(String),

    /// The upstream could not be reached, or the exchange failed before a
    /// status line arrived (maps to 502 Bad Gateway)
    #[error("Upstream transport failed: {0}")]
    Upstream(String),

    /// The upstream body failed mid-stream, after the status was already
    /// relayed to the caller
    #[error("Relay interrupted: {0}")]
    Relay(String),
}

impl ProxyError {
    /// Status code reported to the caller when this error ends a request.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Translation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Upstream(_) | ProxyError::Relay(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Convert error to an HTTP response.
    ///
    /// The body is always empty. Failure detail is written to the log and
    /// never echoed back to the caller.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let mut resp = Response::new(Full::new(Bytes::new()));
        *resp.status_mut() = self.status();
        resp
    }
}

/// Result type alias for relay operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body::Body as _;

    #[test]
    fn translation_maps_to_500() {
        let err = ProxyError::Translation("bad target".into());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn upstream_maps_to_502() {
        let err = ProxyError::Upstream("connection refused".into());
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn error_response_has_empty_body() {
        let resp = ProxyError::Upstream("boom".into()).to_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.body().size_hint().exact(),
            Some(0),
            "proxy-generated responses carry no body detail"
        );
    }
}
