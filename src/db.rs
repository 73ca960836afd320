use crate::constants::DB_BUSY_TIMEOUT_MS;
use crate::types::{Result, TurnlogError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;

pub type DbPool = SqlitePool;

/// Opens (creating if needed) the database at `path` and brings the schema up to date.
pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DB_BUSY_TIMEOUT_MS));

    let pool = match SqlitePool::connect_with(options).await {
        Ok(p) => p,
        Err(e) => return Err(TurnlogError::Database(e).into()),
    };

    sqlx::migrate!("./migrations").run(&pool).await?;

    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// True when no exchange has been indexed yet.
pub async fn index_is_empty(pool: &DbPool) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM requests_context")
        .fetch_one(pool)
        .await?;
    Ok(count == 0)
}

/// Empties the derived index tables ahead of a full rebuild. Raw captures are untouched.
pub async fn clear_index(pool: &DbPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    let positions = sqlx::query("DELETE FROM messages")
        .execute(&mut *tx)
        .await?;
    let contexts = sqlx::query("DELETE FROM requests_context")
        .execute(&mut *tx)
        .await?;
    let contents = sqlx::query("DELETE FROM message_content")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(
        "Cleared index: {} positions, {} contexts, {} content rows",
        positions.rows_affected(),
        contexts.rows_affected(),
        contents.rows_affected()
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexTotals {
    pub positions: i64,
    pub unique_messages: i64,
    pub exchanges: i64,
}

pub async fn index_totals(pool: &DbPool) -> Result<IndexTotals> {
    let (positions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
        .fetch_one(pool)
        .await?;
    let (unique_messages,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM message_content")
        .fetch_one(pool)
        .await?;
    let (exchanges,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM requests_context")
        .fetch_one(pool)
        .await?;
    Ok(IndexTotals {
        positions,
        unique_messages,
        exchanges,
    })
}
