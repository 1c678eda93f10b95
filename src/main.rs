//! signgate - transparent signing proxy daemon.
//!
//! Listens on `PORT`, relays every request to `REMOTE_HOST`, and injects the
//! HMAC envelope headers the upstream requires. All four required settings
//! come from the environment; see [`signgate::config::Settings`].

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use signgate::config::Settings;
use signgate::logging_layer::logging_layer;
use signgate::relay::RelayService;
use signgate::server;
use signgate::signer::EnvelopeSigner;
use signgate::upstream::HttpTransport;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tracing::{error, info};

/// Command-line options. The required settings (upstream, port, identity)
/// come from the environment, not flags.
#[derive(Parser, Debug, Clone)]
#[command(name = "signgate", version, about, long_about = None)]
struct Cli {
    /// Bind address (default: 0.0.0.0); the listen port comes from PORT
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Graceful shutdown timeout in seconds (default: 30)
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "30")]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(reason = %e, "Invalid configuration — refusing to start");
            std::process::exit(1);
        }
    };

    let transport = match HttpTransport::new() {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!(reason = %e, "Failed to build upstream transport — refusing to start");
            std::process::exit(1);
        }
    };

    let signer = EnvelopeSigner::new(Arc::new(settings.identity.clone()));
    let relay = RelayService::new(settings.upstream.clone(), signer, transport);

    let service_stack = ServiceBuilder::new().layer(logging_layer()).service(relay);

    let addr = format!("{}:{}", cli.bind, settings.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(reason = %e, addr = %addr, "Failed to bind listener — refusing to start");
            std::process::exit(1);
        }
    };

    info!(
        bind = %cli.bind,
        port = settings.port,
        upstream = %settings.upstream,
        user_id = %settings.identity.user_id(),
        shutdown_timeout = cli.shutdown_timeout,
        addr = %addr,
        "signgate proxy starting"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    setup_signal_handlers(shutdown_tx.clone());

    server::run(
        listener,
        service_stack,
        shutdown_tx,
        Duration::from_secs(cli.shutdown_timeout),
    )
    .await;

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
///
/// - SIGINT (Ctrl+C): Begin graceful shutdown
/// - SIGTERM: Begin graceful shutdown
fn setup_signal_handlers(shutdown: broadcast::Sender<()>) {
    let shutdown_sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                let _ = shutdown_sigint.send(());
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        let shutdown_sigterm = shutdown;
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    let _ = shutdown_sigterm.send(());
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    // Prevent unused variable warning on non-Unix
    #[cfg(not(unix))]
    let _ = shutdown;
}
