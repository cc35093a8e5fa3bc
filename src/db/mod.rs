use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Open a PostgreSQL pool sized for the calling process. Four separate
/// processes (API, two worker pools, scheduler) each hold their own pool,
/// so the per-process cap comes from configuration instead of one shared
/// constant: the API serves many concurrent handlers, a worker only needs
/// a connection per task slot plus one for control tasks.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
}

/// Apply pending migrations from ./migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub mod queries;
