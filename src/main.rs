use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hls_relay::{config::Config, registry::StreamRegistry, web::WebServer};

#[derive(Parser)]
#[command(name = "hls-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Authenticated fMP4 ingest and live HLS relay with supervised ffmpeg uploaders")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("hls_relay={}", cli.log_level).into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting hls-relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }

    tokio::fs::create_dir_all(&config.storage.segments_dir).await?;
    info!(
        "Segment storage at {}",
        config.storage.segments_dir.display()
    );

    let config = Arc::new(config);
    let registry = StreamRegistry::new(config.clone());

    let server = WebServer::new(config, registry.clone())?;
    server.serve(shutdown_signal()).await?;

    // Finalize every live playlist so downstream readers see ENDLIST.
    info!("shutting down, retiring active sessions");
    registry.shutdown().await;

    Ok(())
}

/// Resolves on ctrl-c or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
