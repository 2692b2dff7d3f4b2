use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use ws_controller::Config;
use ws_orchestrator::db::{backup_database, create_pool, run_migrations};
use ws_orchestrator::{run_supervised, Clients, InMemoryCloud, Reconciler};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = ws_logging::init_subscriber();

    info!("Starting workspace controller...");

    let config = Config::from_env();
    info!(
        db_path = %config.db_path.display(),
        interval_secs = config.reconcile_interval_secs,
        max_concurrent = config.max_concurrent_workspaces,
        "Configuration loaded"
    );

    // Backup before migrations
    let db_path = &config.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    warn!("No cloud backend configured, using the in-memory backend");
    let clients = Clients::from_backend(Arc::new(InMemoryCloud::new()));

    let reconciler = Arc::new(Reconciler::new(
        pool,
        clients,
        config.reconciler_settings(),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(run_supervised(reconciler, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send(true)?;

    let restarts = supervisor.await?;
    info!(restarts, "Workspace controller stopped");

    Ok(())
}
