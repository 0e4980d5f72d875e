use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use xronos::config::SchedulerConfig;
use xronos::engine::Engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = SchedulerConfig::from_env();
    xronos::observability::init(config.metrics_port)?;

    info!("xronos starting");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  wal: {}", config.wal_path().display());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!("  retry_attempts: {}", config.retry_attempts);
    info!("  max_group_depth: {}", config.max_group_depth);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let engine = Arc::new(Engine::open(config)?);
    let compactor = tokio::spawn(xronos::compactor::run_compactor(
        engine.clone(),
        Duration::from_secs(30),
    ));

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
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
    compactor.abort();
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("xronos stopped");
    Ok(())
}
