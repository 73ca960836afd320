//! Raw exchange records as written by the capture layer.

use crate::constants::MESSAGES_ENDPOINT;
use crate::db::DbPool;
use crate::types::{ExchangeId, ExchangeRecord, Result, TurnlogError};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct NewRequest {
    /// Generated when absent.
    pub id: Option<String>,
    /// RFC 3339; the current time when absent.
    pub timestamp: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub body: Value,
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub async fn save_request(pool: &DbPool, request: NewRequest) -> Result<ExchangeId> {
    let id = request
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let timestamp = request.timestamp.unwrap_or_else(now_timestamp);
    let model = request
        .model
        .or_else(|| request.body.get("model").and_then(|m| m.as_str()).map(String::from));
    let endpoint = request
        .endpoint
        .unwrap_or_else(|| MESSAGES_ENDPOINT.to_string());
    let body = serde_json::to_string(&request.body)?;

    sqlx::query(
        "INSERT INTO requests (id, timestamp, endpoint, model, body) VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(&id)
    .bind(&timestamp)
    .bind(&endpoint)
    .bind(model.as_deref())
    .bind(&body)
    .execute(pool)
    .await?;

    tracing::debug!("[CAPTURE] Saved request {} at {}", id, timestamp);
    Ok(ExchangeId(id))
}

/// Stores the captured response (buffered body or streamed chunks) for `id`.
pub async fn attach_response(pool: &DbPool, id: &ExchangeId, response: &Value) -> Result<()> {
    let raw = serde_json::to_string(response)?;
    let result = sqlx::query("UPDATE requests SET response = ?1 WHERE id = ?2")
        .bind(&raw)
        .bind(id.as_str())
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(TurnlogError::NotFound(format!("request {}", id)).into());
    }
    Ok(())
}

pub async fn load_exchange(pool: &DbPool, id: &ExchangeId) -> Result<ExchangeRecord> {
    let row = sqlx::query_as::<sqlx::Sqlite, (String, String, String, Option<String>)>(
        "SELECT id, timestamp, body, response FROM requests WHERE id = ?1",
    )
    .bind(id.as_str())
    .fetch_optional(pool)
    .await?;

    match row {
        Some((id, timestamp, request_body, response_body)) => Ok(ExchangeRecord {
            id: ExchangeId(id),
            timestamp,
            request_body,
            response_body,
        }),
        None => Err(TurnlogError::NotFound(format!("request {}", id)).into()),
    }
}

pub async fn load_body(pool: &DbPool, id: &ExchangeId) -> Result<String> {
    let row = sqlx::query_as::<sqlx::Sqlite, (String,)>("SELECT body FROM requests WHERE id = ?1")
        .bind(id.as_str())
        .fetch_optional(pool)
        .await?;
    match row {
        Some((body,)) => Ok(body),
        None => Err(TurnlogError::NotFound(format!("request {}", id)).into()),
    }
}
