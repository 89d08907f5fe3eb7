pub mod models;

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::store::{AnyRowStore, MemoryRowStore, PgRowStore};

/// Open the Row Store backend: Postgres when a database URL is configured,
/// process memory otherwise.
pub async fn open_row_store(database_url: Option<&str>) -> Result<AnyRowStore> {
    let Some(url) = database_url else {
        info!("DATABASE_URL not set; rows are kept in memory only");
        return Ok(AnyRowStore::Memory(MemoryRowStore::new()));
    };

    let pool = connect(url).await?;
    migrate(&pool).await?;
    info!("Postgres row store ready");
    Ok(AnyRowStore::Postgres(PgRowStore::new(pool)))
}

async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to run sheet_rows migrations")
}
