use std::sync::Arc;

use tracing::info;

use stayledger::catalog::InMemoryCatalog;
use stayledger::config::Config;
use stayledger::engine::Engine;
use stayledger::gateway::SandboxGateway;
use stayledger::notify::NotifyHub;
use stayledger::reaper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    stayledger::observability::init(config.metrics_port);

    let catalog = match &config.seed_file {
        Some(path) => InMemoryCatalog::load(path)?,
        None => InMemoryCatalog::new(),
    };
    info!("stayledger starting");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  listings: {}", catalog.listing_count());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        Arc::new(catalog),
        Arc::new(SandboxGateway::new()),
        notify.clone(),
        config.engine.clone(),
    )?);
    info!(
        bookings = engine.booking_count(),
        properties = engine.property_count(),
        "engine ready"
    );

    let sweeper = tokio::spawn(reaper::run_completion_sweeper(
        engine.clone(),
        config.sweep_interval,
    ));
    let compactor = tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.sweep_interval,
    ));

    // Graceful shutdown on SIGTERM/ctrl-c.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    sweeper.abort();
    compactor.abort();
    notify.prune();
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("stayledger stopped");
    Ok(())
}
