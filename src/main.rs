use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use llmops_relay::backend;
use llmops_relay::config::{normalize_addr, Config};
use llmops_relay::metrics::sink_from_config;
use llmops_relay::relay::ChatRelay;
use llmops_relay::server;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // Configure logging
    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().init();
        }
        _ => {
            tracing_subscriber::fmt().init();
        }
    }

    // Backend selection is fixed for the life of the process. A bad
    // configuration still serves /health and answers /chat with 400.
    let backend = config.backend_config().and_then(backend::from_config);
    match &backend {
        Ok(b) => info!(
            backend = b.name(),
            base_url = b.base_url(),
            default_model = b.default_model(),
            "using backend"
        ),
        Err(e) => warn!(error = %e, "no usable backend; /chat will reject requests"),
    }

    // HTTP client for backend calls
    let http_client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            std::process::exit(1);
        }
    };

    let sink = match sink_from_config(&config, http_client.clone()) {
        Ok(sink) => sink,
        Err(e) => {
            error!(error = %e, "failed to configure run tracking");
            std::process::exit(1);
        }
    };

    info!(
        timeout_secs = config.request_timeout_secs,
        "backend request timeout"
    );
    let relay = ChatRelay::new(backend, http_client, sink, config.request_timeout());
    let app = server::build_router(relay);

    let addr = normalize_addr(&config.addr);
    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        error!(addr = addr, error = %e, "failed to bind");
        std::process::exit(1);
    });

    info!(addr = addr, "server starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "server error");
            std::process::exit(1);
        });

    info!("server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
