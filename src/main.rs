use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::fmt;

use headcount::config::Config;
use headcount::ledger::OccupancyLedger;
use headcount::store::WalStore;
use headcount::{compactor, http, observability, seed};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let directives = std::env::var("RUST_LOG").ok();
    fmt().with_env_filter(observability::log_filter(directives.as_deref())).init();

    let config = Config::from_env();
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(WalStore::open(config.wal_path())?);
    let ledger = Arc::new(OccupancyLedger::new(store.clone()));

    if let Some(path) = &config.seed_file {
        seed::load(&ledger, path).await?;
    }

    let compactor_store = store.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        compactor::run_compactor(compactor_store, threshold).await;
    });

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("headcount listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    http::serve(listener, ledger, shutdown_signal()).await?;

    info!("headcount stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining requests");
}
