//! PostgreSQL adapters - sqlx implementations of the persistence ports.
//!
//! - `PostgresLedgerStore` - atomic ledger units and reads
//! - `PostgresEventLog` - standalone event log entries and dedup reads
//! - `PostgresOperatorQueue` - parked notifications
//!
//! Schema lives in `migrations/`.

mod event_log;
mod ledger_store;
mod operator_queue;
mod rows;

pub use event_log::PostgresEventLog;
pub use ledger_store::PostgresLedgerStore;
pub use operator_queue::PostgresOperatorQueue;

use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;

/// Opens the pool described by `config`, applying migrations when asked.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .idle_timeout(config.idle_timeout())
        .max_lifetime(config.max_lifetime())
        .connect(config.url.expose_secret())
        .await?;

    if config.run_migrations {
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("Database migrations applied");
    }

    Ok(pool)
}
