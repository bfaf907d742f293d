#![forbid(unsafe_code)]

use std::net::SocketAddr;

use patlab_adapter::{build_router, AdapterConfig, AdapterRuntime, SAVE_DATA_PATH};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = AdapterConfig::from_env();
    let addr: SocketAddr = config.bind.parse()?;
    let runtime = AdapterRuntime::open(&config)?;
    if config.allowed_origins.is_empty() {
        warn!("PATLAB_ALLOWED_ORIGINS is empty; browsers on other origins will be refused");
    }
    let app = build_router(runtime, &config.allowed_origins);

    let listener = TcpListener::bind(addr).await?;
    info!("patlab_adapter_http listening on http://{addr}{SAVE_DATA_PATH}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("patlab_adapter_http shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(err) => {
                warn!(error = %err, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(err) => {
                warn!(error = %err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
