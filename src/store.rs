use crate::db::DbPool;
use crate::normalize::content_hash;
use crate::types::{CanonicalMessage, MessageId, Result, TurnlogError};
use sqlx::SqliteConnection;

/// A message ready to be interned: canonical bytes plus the fields stored next to them.
#[derive(Debug, Clone)]
pub struct NewContent<'a> {
    pub canonical: &'a str,
    pub role: &'a str,
    pub signature: &'a str,
    pub token_estimate: i64,
    /// Exchange that first produced this content.
    pub created_by: &'a str,
}

/// Resolves canonical content to its stable id, inserting it on first sight.
///
/// Runs on a borrowed connection so callers can keep it inside their transaction.
/// A concurrent insert of the same hash loses quietly on the unique constraint
/// and the winner's id is read back.
pub async fn intern(conn: &mut SqliteConnection, new: NewContent<'_>) -> Result<(MessageId, String)> {
    let hash = content_hash(new.canonical);

    if let Some((id,)) = sqlx::query_as::<sqlx::Sqlite, (i64,)>(
        "SELECT id FROM message_content WHERE message_hash = ?1",
    )
    .bind(&hash)
    .fetch_optional(&mut *conn)
    .await?
    {
        return Ok((MessageId(id), hash));
    }

    let inserted = sqlx::query_as::<sqlx::Sqlite, (i64,)>(
        "INSERT INTO message_content (message_hash, role, signature, content, token_estimate, created_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(message_hash) DO NOTHING RETURNING id",
    )
    .bind(&hash)
    .bind(new.role)
    .bind(new.signature)
    .bind(new.canonical)
    .bind(new.token_estimate.max(0))
    .bind(new.created_by)
    .fetch_optional(&mut *conn)
    .await?;

    let id = match inserted {
        Some((id,)) => {
            tracing::trace!("[STORE] New content {} ({}) -> {}", &hash[..12], new.signature, id);
            id
        }
        // Backstop only: indexer transactions already hold the write lock from
        // their leading DELETE, so the lookup above cannot go stale there.
        None => {
            tracing::debug!("[STORE] Lost insert race on {}, re-reading", &hash[..12]);
            let (id,) = sqlx::query_as::<sqlx::Sqlite, (i64,)>(
                "SELECT id FROM message_content WHERE message_hash = ?1",
            )
            .bind(&hash)
            .fetch_one(&mut *conn)
            .await?;
            id
        }
    };

    Ok((MessageId(id), hash))
}

#[derive(sqlx::FromRow)]
struct ContentRow {
    id: i64,
    role: String,
    signature: String,
    content: String,
    token_estimate: i64,
    created_at: String,
    created_by: String,
}

pub async fn get_message(pool: &DbPool, id: MessageId) -> Result<CanonicalMessage> {
    let row = sqlx::query_as::<sqlx::Sqlite, ContentRow>(
        "SELECT id, role, signature, content, token_estimate, created_at, created_by \
         FROM message_content WHERE id = ?1",
    )
    .bind(id.0)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Err(TurnlogError::NotFound(format!("message {}", id)).into());
    };

    // Rows written by `intern` always hold JSON; anything else is shown as a string.
    let content = serde_json::from_str(&row.content)
        .unwrap_or(serde_json::Value::String(row.content));

    Ok(CanonicalMessage {
        id: MessageId(row.id),
        role: row.role,
        signature: row.signature,
        content,
        token_estimate: row.token_estimate,
        created_at: row.created_at,
        created_by: row.created_by,
    })
}
