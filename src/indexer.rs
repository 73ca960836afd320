//! Turn Indexer: turns one captured exchange into content rows, position rows
//! and a single `requests_context` row, all inside one transaction.

use crate::db::DbPool;
use crate::normalize::{canonical_bytes, compute_signature, normalize_value};
use crate::response::{reconcile_response, ReconciledResponse};
use crate::store::{self, NewContent};
use crate::token_counting::TokenEstimator;
use crate::types::{
    ContextChain, ExchangeContext, ExchangeRecord, MessageId, PositionKind, Result, TurnlogError,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqliteConnection;
use tracing::Instrument;

/// The parts of a request body the indexer relies on.
#[derive(Debug, Deserialize)]
struct RequestBody {
    #[serde(default)]
    messages: Option<Vec<Value>>,
    #[serde(default)]
    system: Option<Value>,
    #[serde(default)]
    tools: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RequestMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexOutcome {
    Indexed(ExchangeContext),
    /// The request carried no messages; nothing was written.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct Indexer {
    pool: DbPool,
    estimator: TokenEstimator,
}

impl Indexer {
    pub fn new(pool: DbPool, estimator: TokenEstimator) -> Self {
        Self { pool, estimator }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn index_exchange(&self, record: &ExchangeRecord) -> Result<IndexOutcome> {
        let span = tracing::info_span!("index_exchange", exchange_id = %record.id);
        self.index_exchange_inner(record).instrument(span).await
    }

    /// Entry point for freshly captured traffic. Failures are logged, never returned.
    pub async fn index_live(&self, record: &ExchangeRecord) {
        match self.index_exchange(record).await {
            Ok(IndexOutcome::Indexed(ctx)) => {
                tracing::debug!(
                    "[LIVE] Indexed {} ({} context messages)",
                    record.id.short(),
                    ctx.context_message_count
                );
            }
            Ok(IndexOutcome::Skipped) => {}
            Err(e) => {
                tracing::warn!("[LIVE] Failed to index {}: {}", record.id, e.with_trace());
            }
        }
    }

    async fn index_exchange_inner(&self, record: &ExchangeRecord) -> Result<IndexOutcome> {
        let request: RequestBody = serde_json::from_str(&record.request_body)
            .map_err(|e| TurnlogError::InvalidRequest(format!("failed to parse request body: {}", e)))?;

        let messages = request.messages.unwrap_or_default();
        if messages.is_empty() {
            tracing::debug!("No messages in request, skipping");
            return Ok(IndexOutcome::Skipped);
        }

        let system_tokens = self.estimator.estimate_system(request.system.as_ref());
        let tools_tokens = self.estimator.estimate_tools(request.tools.as_ref());

        let reconciled = match record.response_body.as_deref() {
            Some(raw) if !raw.trim().is_empty() => reconcile_response(raw),
            _ => ReconciledResponse::default(),
        };

        let mut tx = self.pool.begin().await?;

        // Replace any earlier index of this exchange.
        sqlx::query("DELETE FROM messages WHERE id = ?1")
            .bind(record.id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM requests_context WHERE id = ?1")
            .bind(record.id.as_str())
            .execute(&mut *tx)
            .await?;

        let trigger_position = messages.len() - 1;
        let mut chain = ContextChain::new();

        for (position, raw) in messages.into_iter().enumerate() {
            let message: RequestMessage = serde_json::from_value(raw).map_err(|e| {
                TurnlogError::InvalidRequest(format!("failed to parse message {}: {}", position, e))
            })?;
            let value = json!({"role": message.role, "content": message.content});
            let (id, hash) = self.intern_value(&mut *tx, &value, record).await?;

            let kind = if position == trigger_position {
                PositionKind::Trigger
            } else {
                PositionKind::Context
            };
            sqlx::query(
                "INSERT INTO messages (id, message_position, timestamp, message_hash, message_id, kind) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(record.id.as_str())
            .bind(position as i64)
            .bind(&record.timestamp)
            .bind(&hash)
            .bind(id.0)
            .bind(kind.as_i64())
            .execute(&mut *tx)
            .await?;

            chain.push(id);
        }

        let response_message_id = match &reconciled.message {
            Some(message) => Some(self.intern_value(&mut *tx, message, record).await?.0),
            None => None,
        };

        let context = chain.without_last();
        let last_message_id = match chain.last() {
            Some(id) => id,
            None => {
                return Err(TurnlogError::Internal(
                    "message chain empty after indexing".to_string(),
                    tracing_error::SpanTrace::capture(),
                )
                .into())
            }
        };

        let row = ExchangeContext {
            id: record.id.clone(),
            timestamp: record.timestamp.clone(),
            last_message_id,
            context_message_count: context.len() as i64,
            context,
            new_context: chain,
            response: reconciled.metadata,
            response_message_id,
            system_tokens,
            tools_tokens,
        };
        insert_context_row(&mut *tx, &row).await?;

        tx.commit().await?;

        tracing::debug!(
            "Indexed: context={} new_context={} response={:?}",
            row.context.display(),
            row.new_context.display(),
            row.response_message_id
        );
        Ok(IndexOutcome::Indexed(row))
    }

    async fn intern_value(
        &self,
        conn: &mut SqliteConnection,
        message: &Value,
        record: &ExchangeRecord,
    ) -> Result<(MessageId, String)> {
        let normalized = normalize_value(message).unwrap_or_else(|| message.clone());
        let canonical = canonical_bytes(message);
        let role = normalized
            .get("role")
            .and_then(|r| r.as_str())
            .unwrap_or_default();
        let signature = normalized
            .get("content")
            .map(compute_signature)
            .unwrap_or_default();
        let token_estimate = self.estimator.estimate_message(&normalized);

        store::intern(
            conn,
            NewContent {
                canonical: &canonical,
                role,
                signature: &signature,
                token_estimate,
                created_by: record.id.as_str(),
            },
        )
        .await
    }
}

async fn insert_context_row(conn: &mut SqliteConnection, row: &ExchangeContext) -> Result<()> {
    let meta = &row.response;
    sqlx::query(
        "INSERT INTO requests_context (id, timestamp, last_message_id, context, new_context, \
         context_msg_count, status_code, streaming, stop_reason, response_id, response_role, \
         response_signature, response_message_id, system_tokens, tools_tokens) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
    )
    .bind(row.id.as_str())
    .bind(&row.timestamp)
    .bind(row.last_message_id.0)
    .bind(row.context.to_storage_string())
    .bind(row.new_context.to_storage_string())
    .bind(row.context_message_count)
    .bind(meta.status_code)
    .bind(meta.streaming)
    .bind(meta.stop_reason.as_deref())
    .bind(meta.response_id.as_deref())
    .bind(meta.response_role.as_deref())
    .bind(meta.response_signature.as_deref())
    .bind(row.response_message_id.map(|id| id.0))
    .bind(row.system_tokens)
    .bind(row.tools_tokens)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
