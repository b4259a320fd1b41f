use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vidflow::config::AppConfig;
use vidflow::services::ServiceContainer;
use vidflow::{database, logging, panic_hook};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before reading any configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    // Keep the guard alive so the file writer flushes on exit
    let _log_guard = logging::init_logging(&config.log_dir)?;
    panic_hook::install(&config.log_dir);

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let cancel_token = CancellationToken::new();
    logging::start_retention_cleanup(config.log_dir.clone(), cancel_token.child_token());

    let container = ServiceContainer::build(&config, pool);
    let report = container.start().await?;
    info!(
        workers = config.workers.max_workers,
        requeued_jobs = report.requeued_jobs,
        "vidflow started"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    cancel_token.cancel();
    container.shutdown().await;
    container.pool.close().await;

    info!("vidflow stopped");
    Ok(())
}
