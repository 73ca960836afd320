use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use turnlog::db::{init_db, DbPool};
use turnlog::indexer::{IndexOutcome, Indexer};
use turnlog::query::get_exchange_context;
use turnlog::store::{self, NewContent};
use turnlog::token_counting::{TokenCounter, TokenEstimator};
use turnlog::types::{ExchangeContext, ExchangeId, ExchangeRecord, MessageId, TurnlogError};

struct WhitespaceCounter;

impl TokenCounter for WhitespaceCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

async fn setup_with(estimator: TokenEstimator) -> (TempDir, DbPool, Indexer) {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let pool = match init_db(dir.path().join("index.db")).await {
        Ok(p) => p,
        Err(e) => panic!("Failed to init DB: {:?}", e),
    };
    let indexer = Indexer::new(pool.clone(), estimator);
    (dir, pool, indexer)
}

async fn setup() -> (TempDir, DbPool, Indexer) {
    setup_with(TokenEstimator::disabled()).await
}

fn record(id: &str, ts: &str, body: Value, response: Option<Value>) -> ExchangeRecord {
    ExchangeRecord {
        id: ExchangeId::from(id),
        timestamp: ts.to_string(),
        request_body: body.to_string(),
        response_body: response.map(|r| r.to_string()),
    }
}

fn buffered(text: &str) -> Value {
    json!({
        "statusCode": 200,
        "isStreaming": false,
        "body": {
            "id": "msg_01",
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "stop_reason": "end_turn"
        }
    })
}

async fn index_ok(indexer: &Indexer, rec: &ExchangeRecord) -> ExchangeContext {
    match indexer.index_exchange(rec).await {
        Ok(IndexOutcome::Indexed(ctx)) => ctx,
        Ok(IndexOutcome::Skipped) => panic!("exchange {} unexpectedly skipped", rec.id),
        Err(e) => panic!("indexing {} failed: {}", rec.id, e.with_trace()),
    }
}

async fn count(pool: &DbPool, sql: &str) -> i64 {
    match sqlx::query_as::<sqlx::Sqlite, (i64,)>(sql).fetch_one(pool).await {
        Ok((n,)) => n,
        Err(e) => panic!("count query failed: {:?}", e),
    }
}

fn three_message_body() -> Value {
    json!({
        "model": "claude-sonnet",
        "messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": [{"type": "text", "text": "hello"}]},
            {"role": "user", "content": "how are you"}
        ]
    })
}

#[tokio::test]
async fn test_three_message_exchange() {
    let (_dir, pool, indexer) = setup().await;

    let rec = record(
        "req-1",
        "2025-01-01T10:00:00.000Z",
        three_message_body(),
        Some(buffered("good")),
    );
    let ctx = index_ok(&indexer, &rec).await;

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM message_content").await, 4);

    let ids = ctx.new_context.ids().to_vec();
    assert_eq!(ids.len(), 3);
    assert_eq!(ctx.context.ids(), &ids[..2]);
    assert_eq!(ctx.context_message_count, 2);
    assert_eq!(ctx.last_message_id, ids[2]);

    let response_id = match ctx.response_message_id {
        Some(id) => id,
        None => panic!("response message was not interned"),
    };
    assert!(!ids.contains(&response_id));
    assert_eq!(ctx.response.response_signature.as_deref(), Some("text"));
    assert_eq!(ctx.response.stop_reason.as_deref(), Some("end_turn"));
    assert_eq!(ctx.response.status_code, Some(200));
    assert_eq!(ctx.response.streaming, Some(false));
    assert_eq!(ctx.response.response_id.as_deref(), Some("msg_01"));

    // The stored row reads back identically
    match get_exchange_context(&pool, &rec.id).await {
        Ok(stored) => assert_eq!(stored, ctx),
        Err(e) => panic!("failed to load context row: {}", e),
    }

    // Position rows: two context slots and the trigger
    let kinds: Vec<(i64, i64, i64)> = match sqlx::query_as(
        "SELECT message_position, message_id, kind FROM messages WHERE id = ?1 ORDER BY message_position",
    )
    .bind("req-1")
    .fetch_all(&pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => panic!("failed to read positions: {:?}", e),
    };
    assert_eq!(
        kinds,
        vec![(0, ids[0].0, 0), (1, ids[1].0, 0), (2, ids[2].0, 1)]
    );
}

#[tokio::test]
async fn test_later_turn_reuses_history_ids() {
    let (_dir, pool, indexer) = setup().await;

    let first = index_ok(
        &indexer,
        &record(
            "req-1",
            "2025-01-01T10:00:00.000Z",
            three_message_body(),
            Some(buffered("good")),
        ),
    )
    .await;

    let next_body = json!({
        "messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": [{"type": "text", "text": "hello"}]},
            {"role": "user", "content": "how are you"},
            {"role": "assistant", "content": [{"type": "text", "text": "good"}]},
            {"role": "user", "content": "glad to hear"}
        ]
    });
    let second = index_ok(
        &indexer,
        &record(
            "req-2",
            "2025-01-01T10:01:00.000Z",
            next_body,
            Some(buffered("thanks")),
        ),
    )
    .await;

    assert_eq!(&second.new_context.ids()[..3], first.new_context.ids());
    // The previous reply comes back as history and resolves to the same row
    assert_eq!(Some(second.new_context.ids()[3]), first.response_message_id);
    // 4 from the first exchange, plus the new trigger and the new reply
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM message_content").await, 6);

    // Provenance stays with the exchange that first produced the content
    match store::get_message(&pool, second.new_context.ids()[0]).await {
        Ok(m) => assert_eq!(m.created_by, "req-1"),
        Err(e) => panic!("get_message failed: {}", e),
    }
}

#[tokio::test]
async fn test_cache_control_and_string_form_dedup() {
    let (_dir, _pool, indexer) = setup().await;

    let plain = index_ok(
        &indexer,
        &record(
            "a",
            "2025-01-01T10:00:00.000Z",
            json!({"messages": [{"role": "user", "content": "hello there"}]}),
            None,
        ),
    )
    .await;
    let hinted = index_ok(
        &indexer,
        &record(
            "b",
            "2025-01-01T10:00:01.000Z",
            json!({"messages": [{
                "role": "user",
                "content": [{"type": "text", "text": "hello there", "cache_control": {"type": "ephemeral"}}]
            }]}),
            None,
        ),
    )
    .await;

    assert_eq!(plain.last_message_id, hinted.last_message_id);
}

#[tokio::test]
async fn test_single_message_has_empty_context() {
    let (_dir, pool, indexer) = setup().await;

    let ctx = index_ok(
        &indexer,
        &record(
            "solo",
            "2025-01-01T10:00:00.000Z",
            json!({"messages": [{"role": "user", "content": "only one"}]}),
            None,
        ),
    )
    .await;

    assert!(ctx.context.is_empty());
    assert_eq!(ctx.new_context.len(), 1);
    assert_eq!(ctx.context_message_count, 0);
    assert_eq!(ctx.response_message_id, None);
    assert_eq!(ctx.response.streaming, None);

    let stored: (String, String) = match sqlx::query_as(
        "SELECT context, new_context FROM requests_context WHERE id = 'solo'",
    )
    .fetch_one(&pool)
    .await
    {
        Ok(r) => r,
        Err(e) => panic!("failed to read row: {:?}", e),
    };
    assert_eq!(stored.0, "");
    assert_eq!(stored.1, ctx.last_message_id.to_string());
}

#[tokio::test]
async fn test_request_without_messages_is_skipped() {
    let (_dir, pool, indexer) = setup().await;

    for (id, body) in [
        ("empty", json!({"messages": []})),
        ("absent", json!({"model": "claude", "max_tokens": 1})),
    ] {
        match indexer
            .index_exchange(&record(id, "2025-01-01T10:00:00.000Z", body, None))
            .await
        {
            Ok(IndexOutcome::Skipped) => (),
            Ok(other) => panic!("expected skip for {}, got {:?}", id, other),
            Err(e) => panic!("unexpected error for {}: {}", id, e),
        }
    }
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM requests_context").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM message_content").await, 0);
}

#[tokio::test]
async fn test_malformed_request_body_is_an_error() {
    let (_dir, _pool, indexer) = setup().await;

    let rec = ExchangeRecord {
        id: ExchangeId::from("bad"),
        timestamp: "2025-01-01T10:00:00.000Z".to_string(),
        request_body: "{not json".to_string(),
        response_body: None,
    };
    match indexer.index_exchange(&rec).await {
        Err(e) => assert!(matches!(e.inner, TurnlogError::InvalidRequest(_))),
        Ok(o) => panic!("expected error, got {:?}", o),
    }

    let wrong_shape = record(
        "bad-shape",
        "2025-01-01T10:00:00.000Z",
        json!({"messages": "not a list"}),
        None,
    );
    match indexer.index_exchange(&wrong_shape).await {
        Err(e) => assert!(matches!(e.inner, TurnlogError::InvalidRequest(_))),
        Ok(o) => panic!("expected error, got {:?}", o),
    }
}

#[tokio::test]
async fn test_failure_mid_exchange_leaves_nothing_behind() {
    let (_dir, pool, indexer) = setup().await;

    // The first message is interned before the second one fails to parse
    let broken = record(
        "atomic",
        "2025-01-01T10:00:00.000Z",
        json!({"messages": [{"role": "user", "content": "first of its kind"}, 42]}),
        Some(buffered("never stored")),
    );
    match indexer.index_exchange(&broken).await {
        Err(e) => assert!(matches!(e.inner, TurnlogError::InvalidRequest(_))),
        Ok(o) => panic!("expected error, got {:?}", o),
    }

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM message_content").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM messages").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM requests_context").await, 0);

    // A corrected capture of the same exchange then indexes cleanly
    let fixed = record(
        "atomic",
        "2025-01-01T10:00:00.000Z",
        json!({"messages": [{"role": "user", "content": "first of its kind"}, {"role": "user", "content": "second"}]}),
        Some(buffered("stored now")),
    );
    let ctx = index_ok(&indexer, &fixed).await;
    assert_eq!(ctx.new_context.len(), 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM message_content").await, 3);
}

#[tokio::test]
async fn test_reindex_replaces_row() {
    let (_dir, pool, indexer) = setup().await;

    let rec = record(
        "again",
        "2025-01-01T10:00:00.000Z",
        three_message_body(),
        Some(buffered("good")),
    );
    let first = index_ok(&indexer, &rec).await;
    let second = index_ok(&indexer, &rec).await;

    assert_eq!(first, second);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM requests_context WHERE id = 'again'").await,
        1
    );
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM messages WHERE id = 'again'").await,
        3
    );
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM message_content").await, 4);
}

#[tokio::test]
async fn test_malformed_response_degrades_to_null_fields() {
    let (_dir, pool, indexer) = setup().await;

    let rec = ExchangeRecord {
        id: ExchangeId::from("half"),
        timestamp: "2025-01-01T10:00:00.000Z".to_string(),
        request_body: three_message_body().to_string(),
        response_body: Some("{\"statusCode\": 200, \"body\": {truncated".to_string()),
    };
    let ctx = index_ok(&indexer, &rec).await;

    assert_eq!(ctx.response_message_id, None);
    assert_eq!(ctx.response.stop_reason, None);
    assert_eq!(ctx.response.status_code, None);
    assert_eq!(ctx.response.response_signature, None);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM message_content").await, 3);
}

#[tokio::test]
async fn test_streamed_and_buffered_replies_share_content() {
    let (_dir, _pool, indexer) = setup().await;

    let streamed = json!({
        "statusCode": 200,
        "isStreaming": true,
        "streamingChunks": [
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_s\",\"role\":\"assistant\",\"content\":[]}}",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"go\"}}",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"od\"}}",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}"
        ]
    });

    let s = index_ok(
        &indexer,
        &record("s", "2025-01-01T10:00:00.000Z", three_message_body(), Some(streamed)),
    )
    .await;
    let b = index_ok(
        &indexer,
        &record("b", "2025-01-01T10:00:01.000Z", three_message_body(), Some(buffered("good"))),
    )
    .await;

    assert!(s.response_message_id.is_some());
    assert_eq!(s.response_message_id, b.response_message_id);
    assert_eq!(s.response.streaming, Some(true));
    assert_eq!(s.response.stop_reason.as_deref(), Some("end_turn"));
    assert_eq!(s.response.response_id.as_deref(), Some("msg_s"));
    assert_eq!(s.response.response_role.as_deref(), Some("assistant"));
    assert_eq!(s.response.response_signature.as_deref(), Some("text"));
}

#[tokio::test]
async fn test_token_estimates_recorded() {
    let (_dir, pool, indexer) =
        setup_with(TokenEstimator::new(Arc::new(WhitespaceCounter))).await;

    let body = json!({
        "system": [{"type": "text", "text": "you are a careful assistant"}],
        "tools": [{"name": "Read"}],
        "messages": [{"role": "user", "content": "count these four words"}]
    });
    let ctx = index_ok(&indexer, &record("tok", "2025-01-01T10:00:00.000Z", body, None)).await;

    assert_eq!(ctx.system_tokens, 5);
    assert_eq!(ctx.tools_tokens, 1);
    match store::get_message(&pool, ctx.last_message_id).await {
        Ok(m) => {
            assert_eq!(m.token_estimate, 4);
            assert_eq!(m.role, "user");
            assert_eq!(m.signature, "text");
            assert_eq!(
                m.content,
                json!({"role": "user", "content": [{"type": "text", "text": "count these four words"}]})
            );
        }
        Err(e) => panic!("get_message failed: {}", e),
    }
}

#[tokio::test]
async fn test_intern_twice_returns_same_id() {
    let (_dir, pool, _indexer) = setup().await;

    let mut conn = match pool.acquire().await {
        Ok(c) => c,
        Err(e) => panic!("Failed to acquire connection: {:?}", e),
    };
    let canonical = r#"{"content":[{"text":"x","type":"text"}],"role":"user"}"#;
    let new = || NewContent {
        canonical,
        role: "user",
        signature: "text",
        token_estimate: 0,
        created_by: "direct",
    };

    let first = match store::intern(&mut conn, new()).await {
        Ok(r) => r,
        Err(e) => panic!("intern failed: {}", e),
    };
    let second = match store::intern(&mut conn, new()).await {
        Ok(r) => r,
        Err(e) => panic!("intern failed: {}", e),
    };
    assert_eq!(first, second);
    assert_eq!(first.1.len(), 64);
    drop(conn);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM message_content").await, 1);
}

#[tokio::test]
async fn test_get_message_not_found() {
    let (_dir, pool, _indexer) = setup().await;

    match store::get_message(&pool, MessageId(9999)).await {
        Err(e) => assert!(matches!(e.inner, TurnlogError::NotFound(_))),
        Ok(m) => panic!("expected NotFound, got {:?}", m),
    }
}
