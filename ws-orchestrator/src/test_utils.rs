use crate::clients::{Clients, InMemoryCloud};
use crate::reconciler::ReconcilerSettings;
use crate::transaction::{Naming, TransactionContext};
use crate::workspace::WorkspaceStore;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

/// Helper to create an in-memory test database with migrations applied.
/// A single connection keeps every query on the same in-memory database.
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Transaction context backed by `cloud`
pub fn test_context(pool: &SqlitePool, cloud: &Arc<InMemoryCloud>) -> TransactionContext {
    TransactionContext {
        clients: Clients::from_backend(cloud.clone()),
        store: WorkspaceStore::new(pool.clone()),
        naming: Naming::default(),
    }
}

/// Settings that tick fast and retry immediately
pub fn fast_settings() -> ReconcilerSettings {
    let mut settings = ReconcilerSettings {
        interval: Duration::from_millis(10),
        call_timeout: Duration::from_secs(5),
        ..ReconcilerSettings::default()
    };
    settings.retry.base = Duration::ZERO;
    settings.retry.max = Duration::ZERO;
    settings
}
