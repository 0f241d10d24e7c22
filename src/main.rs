use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use mft_dashboard::config::{CliArgs, DashboardConfig};
use mft_dashboard::producer::Producers;
use mft_dashboard::report::load_report;
use mft_dashboard::server;
use mft_dashboard::state::{DashboardState, LoadedReport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // Console logging, plus a daily-rotated file when --log-dir is given
    let (file_layer, _file_guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mft-dashboard.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mft_dashboard=info,tower_http=info".into()),
        )
        .with(fmt::layer())
        .with(file_layer)
        .init();

    info!("Starting mft-dashboard v{}", env!("CARGO_PKG_VERSION"));
    info!("Backend: {}", args.backend_url);
    match &args.log_file {
        Some(path) => info!("Tailing log file {:?}", path),
        None => info!("Tailing backend log"),
    }

    let config = DashboardConfig::from_args(args);
    let port = config.port;
    let preload = config.report.clone();

    let state = DashboardState::shared(config)?;

    if let Some(path) = preload {
        match load_report(&path).await {
            Ok(document) => {
                info!("Loaded report {:?}", path);
                *state.report.write().await = Some(LoadedReport::new(document));
            }
            Err(e) => warn!("Could not load report {:?}: {}", path, e),
        }
    }

    let mut producers = Producers::start(&state);
    info!("Producers running: {}", producers.names().join(", "));

    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Dashboard listening on http://0.0.0.0:{}", port);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Dashboard shutting down");
    producers.shutdown().await;

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
