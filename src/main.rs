use color_eyre::{eyre::eyre, Result};
use mqtt_ws_bridge::{http, Bridge, BridgeConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = BridgeConfig::load().await?;
    info!("Starting bridge with configuration: {:?}", config);

    let bridge = Arc::new(Bridge::new(config.broker.clone()));
    let router = http::build_router(Arc::clone(&bridge), &config.static_dir);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| eyre!("Failed to bind {}: {}", config.listen_addr, e))?;

    let shutdown_bridge = Arc::clone(&bridge);
    http::serve(listener, router, async move {
        shutdown_signal().await;
        shutdown_bridge.shutdown().await;
    })
    .await
    .map_err(|e| eyre!("Server terminated with error: {}", e))?;

    info!("Bridge stopped");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => error!("Unable to listen for shutdown signal: {}", e),
    }
}
