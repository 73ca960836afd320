use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;

/// Row id of a deduplicated message in `message_content`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i64);

/// Opaque id assigned to an exchange by the capture layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExchangeId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ExchangeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExchangeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl ExchangeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

#[derive(Error, Debug)]
pub enum TurnlogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request body: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: TurnlogError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<TurnlogError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl ObservedError {
    /// Renders the error followed by the span trace captured when it was raised.
    pub fn with_trace(&self) -> String {
        format!("{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// Ordered list of message ids making up a request's message array.
///
/// Held as integers in memory; the comma-joined form only exists at the
/// storage boundary (`requests_context.context` / `new_context`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextChain(pub Vec<MessageId>);

impl ContextChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: MessageId) {
        self.0.push(id);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> &[MessageId] {
        &self.0
    }

    pub fn last(&self) -> Option<MessageId> {
        self.0.last().copied()
    }

    /// Everything but the final id.
    pub fn without_last(&self) -> ContextChain {
        match self.0.split_last() {
            Some((_, rest)) => ContextChain(rest.to_vec()),
            None => ContextChain::new(),
        }
    }

    /// Prefix used to look up other exchanges of the same conversation:
    /// drop 2 ids when there are at least 4, 1 when there are at least 2.
    pub fn search_prefix(&self) -> ContextChain {
        let pop = match self.0.len() {
            n if n >= 4 => 2,
            n if n >= 2 => 1,
            _ => 0,
        };
        ContextChain(self.0[..self.0.len() - pop].to_vec())
    }

    pub fn to_storage_string(&self) -> String {
        self.0
            .iter()
            .map(|id| id.0.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn parse(stored: &str) -> Result<Self> {
        let trimmed = stored.trim();
        if trimmed.is_empty() {
            return Ok(Self::new());
        }
        let mut ids = Vec::new();
        for part in trimmed.split(',') {
            let id = part.trim().parse::<i64>().map_err(|e| {
                TurnlogError::Internal(
                    format!("corrupt context list {:?}: {}", stored, e),
                    SpanTrace::capture(),
                )
            })?;
            ids.push(MessageId(id));
        }
        Ok(Self(ids))
    }

    /// Compact rendering for listings: first 2 ids, the elided count, last 4 ids.
    pub fn display(&self) -> String {
        let n = self.0.len();
        if n <= crate::constants::CONTEXT_DISPLAY_FULL_MAX {
            return self.to_storage_string();
        }
        let join = |ids: &[MessageId]| {
            ids.iter()
                .map(|id| id.0.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        let head = crate::constants::CONTEXT_DISPLAY_HEAD;
        let tail = crate::constants::CONTEXT_DISPLAY_TAIL;
        format!(
            "{},..[{}]..,{}",
            join(&self.0[..head]),
            n - head - tail,
            join(&self.0[n - tail..])
        )
    }
}

impl fmt::Display for ContextChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_storage_string())
    }
}

/// A deduplicated message as stored in `message_content`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    pub id: MessageId,
    pub role: String,
    pub signature: String,
    pub content: serde_json::Value,
    pub token_estimate: i64,
    pub created_at: String,
    pub created_by: String,
}

/// Whether a message slot held prior history or the message that triggered the exchange.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PositionKind {
    Context,
    Trigger,
}

impl PositionKind {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Context => 0,
            Self::Trigger => 1,
        }
    }

    /// `None` for a value no writer produces.
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Context),
            1 => Some(Self::Trigger),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePosition {
    pub exchange_id: ExchangeId,
    pub position: i64,
    pub timestamp: String,
    pub message_hash: String,
    pub message_id: MessageId,
    pub kind: PositionKind,
}

/// Response-level fields recovered from a captured response, whichever wire form it used.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub status_code: Option<i64>,
    pub streaming: Option<bool>,
    pub stop_reason: Option<String>,
    pub response_id: Option<String>,
    pub response_role: Option<String>,
    pub response_signature: Option<String>,
}

/// One row of `requests_context`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeContext {
    pub id: ExchangeId,
    pub timestamp: String,
    pub last_message_id: MessageId,
    pub context: ContextChain,
    pub new_context: ContextChain,
    pub context_message_count: i64,
    #[serde(flatten)]
    pub response: ResponseMetadata,
    pub response_message_id: Option<MessageId>,
    pub system_tokens: i64,
    pub tools_tokens: i64,
}

/// Raw input handed to the indexer: the request body and the captured response, unparsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExchangeRecord {
    pub id: ExchangeId,
    pub timestamp: String,
    pub request_body: String,
    pub response_body: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(ids: &[i64]) -> ContextChain {
        ContextChain(ids.iter().copied().map(MessageId).collect())
    }

    #[test]
    fn test_storage_string_round_trip() {
        let c = chain(&[3, 14, 15]);
        assert_eq!(c.to_storage_string(), "3,14,15");
        match ContextChain::parse("3,14,15") {
            Ok(parsed) => assert_eq!(parsed, c),
            Err(e) => panic!("parse failed: {}", e),
        }
        match ContextChain::parse("") {
            Ok(parsed) => assert!(parsed.is_empty()),
            Err(e) => panic!("parse failed: {}", e),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ContextChain::parse("1,abc,3").is_err());
    }

    #[test]
    fn test_search_prefix_pop_rule() {
        assert_eq!(chain(&[]).search_prefix(), chain(&[]));
        assert_eq!(chain(&[1]).search_prefix(), chain(&[1]));
        assert_eq!(chain(&[1, 2]).search_prefix(), chain(&[1]));
        assert_eq!(chain(&[1, 2, 3]).search_prefix(), chain(&[1, 2]));
        assert_eq!(chain(&[1, 2, 3, 4]).search_prefix(), chain(&[1, 2]));
        assert_eq!(chain(&[1, 2, 3, 4, 5, 6]).search_prefix(), chain(&[1, 2, 3, 4]));
    }

    #[test]
    fn test_search_prefix_is_numeric_not_textual() {
        // "1,2" is a textual prefix of "1,23" but not an id prefix of it.
        let prefix = chain(&[1, 23, 4]).search_prefix();
        assert_eq!(prefix.to_storage_string(), "1,23");
        assert_ne!(prefix, chain(&[1, 2]));
    }

    #[test]
    fn test_without_last() {
        assert_eq!(chain(&[1, 2, 3]).without_last(), chain(&[1, 2]));
        assert_eq!(chain(&[1]).without_last(), chain(&[]));
        assert_eq!(chain(&[]).without_last(), chain(&[]));
    }

    #[test]
    fn test_display_elides_middle() {
        assert_eq!(chain(&[1, 2, 3, 4, 5, 6]).display(), "1,2,3,4,5,6");
        assert_eq!(
            chain(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).display(),
            "1,2,..[3]..,6,7,8,9"
        );
    }
}
