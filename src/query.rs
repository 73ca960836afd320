//! Read side of the index: exchange listings and conversation reconstruction.

use crate::db::DbPool;
use crate::types::{
    ContextChain, ExchangeContext, ExchangeId, MessageId, MessagePosition, PositionKind,
    ResponseMetadata, Result, TurnlogError,
};
use serde::Serialize;

const CONTEXT_COLUMNS: &str = "rc.id, rc.timestamp, rc.last_message_id, rc.context, rc.new_context, \
     rc.context_msg_count, rc.status_code, rc.streaming, rc.stop_reason, rc.response_id, \
     rc.response_role, rc.response_signature, rc.response_message_id, rc.system_tokens, rc.tools_tokens";

#[derive(Debug, sqlx::FromRow)]
struct ContextRow {
    id: String,
    timestamp: String,
    last_message_id: i64,
    context: String,
    new_context: String,
    context_msg_count: i64,
    status_code: Option<i64>,
    streaming: Option<bool>,
    stop_reason: Option<String>,
    response_id: Option<String>,
    response_role: Option<String>,
    response_signature: Option<String>,
    response_message_id: Option<i64>,
    system_tokens: i64,
    tools_tokens: i64,
}

impl ContextRow {
    fn into_context(self) -> Result<ExchangeContext> {
        Ok(ExchangeContext {
            id: ExchangeId(self.id),
            timestamp: self.timestamp,
            last_message_id: MessageId(self.last_message_id),
            context: ContextChain::parse(&self.context)?,
            new_context: ContextChain::parse(&self.new_context)?,
            context_message_count: self.context_msg_count,
            response: ResponseMetadata {
                status_code: self.status_code,
                streaming: self.streaming,
                stop_reason: self.stop_reason,
                response_id: self.response_id,
                response_role: self.response_role,
                response_signature: self.response_signature,
            },
            response_message_id: self.response_message_id.map(MessageId),
            system_tokens: self.system_tokens,
            tools_tokens: self.tools_tokens,
        })
    }
}

pub async fn get_exchange_context(pool: &DbPool, id: &ExchangeId) -> Result<ExchangeContext> {
    let sql = format!("SELECT {} FROM requests_context rc WHERE rc.id = ?1", CONTEXT_COLUMNS);
    let row = sqlx::query_as::<sqlx::Sqlite, ContextRow>(&sql)
        .bind(id.as_str())
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => row.into_context(),
        None => Err(TurnlogError::NotFound(format!("indexed exchange {}", id)).into()),
    }
}

/// The message slots of one exchange in request order.
pub async fn exchange_positions(pool: &DbPool, id: &ExchangeId) -> Result<Vec<MessagePosition>> {
    let rows = sqlx::query_as::<sqlx::Sqlite, (i64, String, String, i64, i64)>(
        "SELECT message_position, timestamp, message_hash, message_id, kind \
         FROM messages WHERE id = ?1 ORDER BY message_position",
    )
    .bind(id.as_str())
    .fetch_all(pool)
    .await?;

    let mut positions = Vec::with_capacity(rows.len());
    for (position, timestamp, message_hash, message_id, kind) in rows {
        let Some(kind) = PositionKind::from_i64(kind) else {
            return Err(TurnlogError::Internal(
                format!("exchange {} position {} has unknown kind {}", id, position, kind),
                tracing_error::SpanTrace::capture(),
            )
            .into());
        };
        positions.push(MessagePosition {
            exchange_id: id.clone(),
            position,
            timestamp,
            message_hash,
            message_id: MessageId(message_id),
            kind,
        });
    }
    Ok(positions)
}

pub async fn latest_exchange_id(pool: &DbPool) -> Result<Option<ExchangeId>> {
    let row = sqlx::query_as::<sqlx::Sqlite, (String,)>(
        "SELECT id FROM requests_context ORDER BY timestamp DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id,)| ExchangeId(id)))
}

/// One listing row: the stored exchange plus figures joined from the content table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSummary {
    #[serde(flatten)]
    pub exchange: ExchangeContext,
    pub model: Option<String>,
    pub context_display: String,
    pub message_count: i64,
    pub trigger_role: Option<String>,
    pub trigger_signature: Option<String>,
    /// Context message estimates plus system and tools.
    pub context_tokens: i64,
    pub last_message_tokens: i64,
    pub response_tokens: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct SummaryRow {
    #[sqlx(flatten)]
    context: ContextRow,
    model: Option<String>,
    trigger_role: Option<String>,
    trigger_signature: Option<String>,
    context_message_tokens: i64,
    last_message_tokens: i64,
    response_tokens: i64,
}

/// Exchanges whose timestamp falls in `[start, end]`, newest first. Either bound may be open.
pub async fn list_exchanges(
    pool: &DbPool,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<Vec<ExchangeSummary>> {
    let sql = format!(
        "SELECT {},
            r.model AS model,
            mc.role AS trigger_role,
            mc.signature AS trigger_signature,
            COALESCE((
                SELECT SUM(mc2.token_estimate)
                FROM messages m2
                JOIN message_content mc2 ON m2.message_id = mc2.id
                WHERE m2.id = rc.id AND m2.kind = 0
            ), 0) AS context_message_tokens,
            COALESCE(mc.token_estimate, 0) AS last_message_tokens,
            COALESCE(resp.token_estimate, 0) AS response_tokens
         FROM requests_context rc
         LEFT JOIN requests r ON r.id = rc.id
         LEFT JOIN message_content mc ON mc.id = rc.last_message_id
         LEFT JOIN message_content resp ON resp.id = rc.response_message_id
         WHERE (?1 IS NULL OR datetime(rc.timestamp) >= datetime(?1))
           AND (?2 IS NULL OR datetime(rc.timestamp) <= datetime(?2))
         ORDER BY rc.timestamp DESC",
        CONTEXT_COLUMNS
    );

    let rows = sqlx::query_as::<sqlx::Sqlite, SummaryRow>(&sql)
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let exchange = row.context.into_context()?;
        out.push(ExchangeSummary {
            context_display: exchange.context.display(),
            message_count: exchange.new_context.len() as i64,
            context_tokens: row.context_message_tokens
                + exchange.system_tokens
                + exchange.tools_tokens,
            exchange,
            model: row.model,
            trigger_role: row.trigger_role,
            trigger_signature: row.trigger_signature,
            last_message_tokens: row.last_message_tokens,
            response_tokens: row.response_tokens,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedExchange {
    pub id: ExchangeId,
    pub timestamp: String,
    pub context: ContextChain,
    pub last_message_id: MessageId,
    pub streaming: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedSearch {
    pub anchor: ExchangeId,
    pub anchor_timestamp: String,
    pub prefix: ContextChain,
    pub matches: Vec<RelatedExchange>,
}

/// Other exchanges of the conversation `id` belongs to, oldest first.
///
/// Matches every exchange whose context equals the search prefix of `id`'s
/// context or extends it by whole ids.
pub async fn find_related(pool: &DbPool, id: &ExchangeId) -> Result<RelatedSearch> {
    let anchor = get_exchange_context(pool, id).await?;
    let prefix = anchor.context.search_prefix();
    let stored = prefix.to_storage_string();

    let rows = sqlx::query_as::<sqlx::Sqlite, (String, String, String, i64, Option<bool>)>(
        "SELECT id, timestamp, context, last_message_id, streaming \
         FROM requests_context \
         WHERE context = ?1 OR context LIKE ?1 || ',%' \
         ORDER BY timestamp ASC",
    )
    .bind(&stored)
    .fetch_all(pool)
    .await?;

    let mut matches = Vec::with_capacity(rows.len());
    for (id, timestamp, context, last_message_id, streaming) in rows {
        matches.push(RelatedExchange {
            id: ExchangeId(id),
            timestamp,
            context: ContextChain::parse(&context)?,
            last_message_id: MessageId(last_message_id),
            streaming,
        });
    }

    tracing::debug!(
        "Prefix [{}] of {} matched {} exchanges",
        stored,
        anchor.id.short(),
        matches.len()
    );

    Ok(RelatedSearch {
        anchor: anchor.id,
        anchor_timestamp: anchor.timestamp,
        prefix,
        matches,
    })
}
