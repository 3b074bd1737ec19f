#![forbid(unsafe_code)]

use crate::store::{MemoryStore, PgStore, Store};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Opens the configured store. Without a database URL the server keeps
/// everything in process memory.
///
/// # Errors
/// Returns an error if the database is configured but unreachable, or if
/// migrations fail. Either is fatal at startup.
pub async fn connect(database_url: Option<&str>) -> anyhow::Result<Arc<dyn Store>> {
    let Some(url) = database_url else {
        info!("DATABASE_URL not set, using in-memory store (snapshots do not survive restart)");
        return Ok(Arc::new(MemoryStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(3))
        .connect(url)
        .await?;

    info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await?;

    info!("Database migrations applied");

    Ok(Arc::new(PgStore::new(pool)))
}
