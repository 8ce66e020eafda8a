//! Instrumented sample HTTP service.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────────┐
//!                         │                   SAMPLE APP                     │
//!                         │                                                  │
//!     Client Request      │  ┌─────────┐    ┌──────────────────────────────┐ │
//!     ────────────────────┼─▶│  http   │───▶│   InstrumentedHandler        │ │
//!                         │  │ server  │    │  span → handler → span end   │ │
//!                         │  └────┬────┘    │  → metrics → request log     │ │
//!                         │       │         └───────┬──────────┬───────────┘ │
//!                         │       │ /metrics        │          │             │
//!                         │       ▼                 ▼          ▼             │
//!                         │  ┌──────────────────┐ ┌────────┐ ┌────────────┐  │
//!     Prometheus scrape ◀─┼──│ MetricsRegistry  │ │ Tracer │ │ logfmt     │──┼──▶ stdout
//!                         │  └──────────────────┘ └───┬────┘ │ logger     │  │
//!                         │                           │      └────────────┘  │
//!                         │                    batch span processor          │
//!                         └───────────────────────────┼──────────────────────┘
//!                                                     ▼
//!                                            collector agent (UDP)
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sample_app::config::load_config;
use sample_app::lifecycle::{signals, startup, Shutdown};
use sample_app::HttpServer;

#[derive(Debug, Parser)]
#[command(name = "sample-app", version, about = "Instrumented sample HTTP service")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind.to_string();
    }

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("{} v{} starting", config.service.name, env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        exporter = ?config.tracing.exporter,
        request_timeout_secs = config.handlers.timeout_secs,
        "Configuration loaded"
    );

    let components = startup::build(&config)?;

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    signals::spawn_signal_listener(shutdown.clone());

    let server = HttpServer::new(&components.telemetry, &config.handlers);
    server.run(listener, shutdown.signalled()).await?;

    components.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
