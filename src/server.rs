//! Listener loop and connection lifecycle.
//!
//! [`run`] accepts connections until a shutdown signal arrives on the
//! broadcast channel, then stops accepting and waits for in-flight
//! connections to drain, up to a deadline. Each connection gets its own task
//! and its own clone of the service stack.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::ProxyError;

/// Connection tracker for graceful shutdown.
#[derive(Clone)]
struct ConnectionTracker {
    active_connections: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    fn new() -> Self {
        Self {
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn increment(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    fn count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }
}

/// Serve connections from `listener` until shutdown, then drain.
///
/// Accept errors and per-connection errors are logged, never fatal. The
/// function returns once the drain completes or `drain_timeout` expires.
pub async fn run<S, B>(
    listener: TcpListener,
    service: S,
    shutdown: broadcast::Sender<()>,
    drain_timeout: Duration,
) where
    S: tower::Service<Request<Incoming>, Response = Response<B>, Error = ProxyError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = bytes::Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let connection_tracker = ConnectionTracker::new();
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            error!(error = %e, "Failed to configure socket");
                        }

                        let service = service.clone();
                        let mut conn_shutdown_rx = shutdown.subscribe();
                        let tracker = connection_tracker.clone();

                        tracker.increment();

                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(
                                stream,
                                peer_addr,
                                service,
                                &mut conn_shutdown_rx,
                            )
                            .await
                            {
                                error!(error = %e, "Connection handling error");
                            }

                            tracker.decrement();
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    info!(
        active_connections = connection_tracker.count(),
        timeout_seconds = drain_timeout.as_secs(),
        "Waiting for active connections to drain"
    );

    let start = std::time::Instant::now();

    while connection_tracker.count() > 0 {
        if start.elapsed() >= drain_timeout {
            warn!(
                active_connections = connection_tracker.count(),
                "Shutdown timeout reached, forcing exit"
            );
            break;
        }

        sleep(Duration::from_millis(100)).await;
    }

    if connection_tracker.count() == 0 {
        info!("All connections drained, shutting down cleanly");
    }
}

/// Handle a single connection with HTTP protocol.
async fn handle_connection<S, B>(
    stream: TcpStream,
    _peer_addr: SocketAddr,
    service: S,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), ProxyError>
where
    S: tower::Service<Request<Incoming>, Response = Response<B>, Error = ProxyError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = bytes::Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |req| {
        let mut svc = service.clone();
        async move {
            // Translate service errors into plain status responses so the
            // connection itself never sees a hyper-level failure.
            let result: Result<_, std::convert::Infallible> = match svc.call(req).await {
                Ok(response) => {
                    // Convert body error to boxed error for hyper compatibility.
                    Ok(response.map(|body| {
                        body.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
                            .boxed()
                    }))
                }
                Err(e) => {
                    error!(error = %e, "Service error");
                    // Full<Bytes> has Infallible error - convert using absurd pattern
                    Ok(e.to_response()
                        .map(|body| body.map_err(|e| match e {}).boxed()))
                }
            };
            result
        }
    });

    let executor = hyper_util::rt::TokioExecutor::new();
    let builder = auto::Builder::new(executor);
    let conn = builder.serve_connection_with_upgrades(io, svc_fn);

    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                error!(error = %e, "Connection error");
            }
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(5), conn).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::RelayBody;
    use bytes::Bytes;
    use http_body_util::Full;

    #[test]
    fn tracker_counts_connections() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.count(), 0);

        tracker.increment();
        tracker.increment();
        assert_eq!(tracker.count(), 2);

        tracker.decrement();
        assert_eq!(tracker.count(), 1);
    }

    /// Minimal service that answers 200 "ok" to everything.
    #[derive(Clone)]
    struct OkService;

    impl tower::Service<Request<Incoming>> for OkService {
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

        fn call(&mut self, _req: Request<Incoming>) -> Self::Future {
            Box::pin(async {
                let body = Full::new(Bytes::from_static(b"ok"));
                Ok(Response::new(body.map_err(|e| match e {}).boxed()))
            })
        }
    }

    #[tokio::test]
    async fn serves_until_shutdown_then_drains() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let server = tokio::spawn(run(
            listener,
            OkService,
            shutdown_tx.clone(),
            Duration::from_secs(1),
        ));

        let body = reqwest::get(format!("http://{addr}/anything"))
            .await
            .expect("request should reach the server")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "ok");

        shutdown_tx.send(()).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop after shutdown")
            .expect("server task should not panic");
    }
}
