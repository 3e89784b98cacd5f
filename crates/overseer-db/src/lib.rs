//! Persistent store adapter for the Overseer CI master.
//!
//! The store is the single source of truth for build requests across the
//! master cluster. Claiming is an atomic compare-and-set against one row;
//! masters coordinate only through it and the event bus.

pub mod error;
pub mod mem;
pub mod postgres;
pub mod store;

pub use error::{DbError, DbResult};
pub use mem::MemRequestStore;
pub use postgres::PgRequestStore;
pub use store::{NewBuildRequest, RequestStore};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
