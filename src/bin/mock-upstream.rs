//! Stand-in upstream for local development and demos.
//!
//! Accepts anything, records what it saw (spy pattern), and answers 200. Set
//! `MOCK_PRIVATE_KEY` to the proxy's key and every history entry gains a
//! `signature_valid` verdict computed over the envelope headers.
//!
//! Endpoints:
//! - `/_admin/history` - captured requests, newest last
//! - `/health` - readiness probe
//! - anything else - captured and answered with `{"ok":true}`

use axum::{
    Json, Router,
    extract::{Request, State},
    routing::get,
};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use signgate::signer::{SIGNATURE_HEADER, TIMESTAMP_HEADER, USER_ID_HEADER, sign_envelope};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;

/// Shared state for tracking all incoming requests (spy pattern)
type RequestHistory = Arc<Mutex<Vec<serde_json::Value>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let history: RequestHistory = Arc::new(Mutex::new(Vec::new()));

    let app = Router::new()
        .route("/_admin/history", get(admin_history))
        .route("/health", get(health_check))
        .fallback(capture)
        .with_state(history);

    let port = std::env::var("MOCK_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("signgate mock upstream listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind to {}: {}", addr, e);
        e
    })?;

    axum::serve(listener, app).await.map_err(|e| {
        tracing::error!("Server error: {}", e);
        e
    })?;

    Ok(())
}

/// Catch-all endpoint that records the request and answers 200.
async fn capture(State(history): State<RequestHistory>, req: Request) -> Json<serde_json::Value> {
    let headers: std::collections::BTreeMap<String, String> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let signature_valid = std::env::var("MOCK_PRIVATE_KEY").ok().map(|key| {
        let expected = sign_envelope(
            key.as_bytes(),
            header_bytes(req.headers(), &USER_ID_HEADER),
            header_bytes(req.headers(), &TIMESTAMP_HEADER),
        );
        req.headers().get(&SIGNATURE_HEADER) == HeaderValue::from_str(&expected).ok().as_ref()
    });

    let entry = serde_json::json!({
        "method": req.method().as_str(),
        "uri": req.uri().to_string(),
        "headers": headers,
        "signature_valid": signature_valid,
    });

    {
        let mut history = history.lock().await;
        history.push(entry);
        tracing::debug!("Captured request #{}", history.len());
    }

    Json(serde_json::json!({"ok": true}))
}

fn header_bytes<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a [u8] {
    headers.get(name).map(HeaderValue::as_bytes).unwrap_or_default()
}

/// Admin endpoint to retrieve captured request history
async fn admin_history(State(history): State<RequestHistory>) -> Json<Vec<serde_json::Value>> {
    let history = history.lock().await;
    tracing::info!(
        "Admin history requested, returning {} captured requests",
        history.len()
    );
    Json(history.clone())
}

/// Health check endpoint for readiness probes
async fn health_check() -> &'static str {
    "OK"
}
