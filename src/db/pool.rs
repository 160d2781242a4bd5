//! PostgreSQL connection pool and schema bootstrap for the message table.

use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

pub type DbPool = sqlx::PgPool;

pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id          UUID PRIMARY KEY,
        kind        TEXT NOT NULL,
        text        TEXT NOT NULL,
        user_id     TEXT NOT NULL,
        username    TEXT NOT NULL,
        lat         DOUBLE PRECISION NOT NULL,
        lng         DOUBLE PRECISION NOT NULL,
        geohash     TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS messages_geohash_created_at ON messages (geohash, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS messages_created_at ON messages (created_at)",
];

/// Create the message table and its indexes if they are missing.
pub async fn ensure_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
