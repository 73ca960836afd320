//! Picks which captured exchanges feed the indexer on a run, and drives batch runs.

use crate::capture;
use crate::constants::INCREMENTAL_LOOKBACK;
use crate::db::DbPool;
use crate::indexer::{IndexOutcome, Indexer};
use crate::types::{ExchangeId, ObservedError, Result};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Every captured exchange, oldest first.
    Full,
    /// Exchanges not yet indexed, within the lookback window of the newest indexed one.
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRef {
    pub id: ExchangeId,
    pub timestamp: String,
}

const SELECT_ALL: &str = "SELECT id, timestamp FROM requests ORDER BY timestamp";

const SELECT_UNINDEXED: &str = "SELECT r.id, r.timestamp FROM requests r \
     WHERE datetime(r.timestamp) >= datetime(?1, ?2) \
       AND r.id NOT IN (SELECT id FROM requests_context) \
     ORDER BY r.timestamp";

/// Lazily streams the exchanges to index for `mode`. Each call re-queries.
///
/// `Incremental` falls back to `Full` when nothing has been indexed yet.
pub async fn select_pending(
    pool: &DbPool,
    mode: IndexMode,
) -> Result<BoxStream<'_, Result<ExchangeRef>>> {
    let cursor = match mode {
        IndexMode::Full => None,
        IndexMode::Incremental => {
            let (max,): (Option<String>,) =
                sqlx::query_as("SELECT MAX(timestamp) FROM requests_context")
                    .fetch_one(pool)
                    .await?;
            let max = max.filter(|ts| !ts.is_empty());
            if max.is_none() {
                tracing::info!("Index is empty, selecting all exchanges");
            }
            max
        }
    };

    let rows = match cursor {
        None => sqlx::query_as::<sqlx::Sqlite, (String, String)>(SELECT_ALL).fetch(pool),
        Some(max_ts) => {
            tracing::debug!("Selecting unindexed exchanges since {} ({})", max_ts, INCREMENTAL_LOOKBACK);
            sqlx::query_as::<sqlx::Sqlite, (String, String)>(SELECT_UNINDEXED)
                .bind(max_ts)
                .bind(INCREMENTAL_LOOKBACK)
                .fetch(pool)
        }
    };

    Ok(rows
        .map(|row| {
            row.map(|(id, timestamp)| ExchangeRef {
                id: ExchangeId(id),
                timestamp,
            })
            .map_err(ObservedError::from)
        })
        .boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub mode: IndexMode,
    pub continue_on_error: bool,
    /// Attach the raw request body to each failure.
    pub capture_bodies: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: ExchangeId,
    pub timestamp: String,
    pub message: String,
    pub request_body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<BatchFailure>,
    /// Set when the run stopped at the first failure.
    pub halted: bool,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }

    pub fn log_summary(&self) {
        if self.failed == 0 {
            tracing::info!(
                "Batch complete: {} indexed, {} skipped",
                self.succeeded,
                self.skipped
            );
        } else {
            tracing::warn!(
                "Batch {}: {} indexed, {} skipped, {} errors",
                if self.halted { "halted" } else { "complete" },
                self.succeeded,
                self.skipped,
                self.failed
            );
        }
    }
}

/// Indexes every pending exchange in order.
///
/// Without `continue_on_error` the run stops at the first failure and the report
/// comes back with `halted` set. `on_failure` sees each failure as it happens.
pub async fn run_batch<F>(
    indexer: &Indexer,
    options: BatchOptions,
    mut on_failure: F,
) -> Result<BatchReport>
where
    F: FnMut(&BatchFailure),
{
    let pool = indexer.pool();
    let mut pending = select_pending(pool, options.mode).await?;
    let mut report = BatchReport::default();

    while let Some(next) = pending.next().await {
        let exchange = next?;
        let outcome = match capture::load_exchange(pool, &exchange.id).await {
            Ok(record) => indexer.index_exchange(&record).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(IndexOutcome::Indexed(_)) => report.succeeded += 1,
            Ok(IndexOutcome::Skipped) => report.skipped += 1,
            Err(e) => {
                report.failed += 1;
                tracing::error!(
                    "Failed to index id={} ts={}: {}",
                    exchange.id,
                    exchange.timestamp,
                    e
                );
                let request_body = if options.capture_bodies {
                    capture::load_body(pool, &exchange.id).await.ok()
                } else {
                    None
                };
                let failure = BatchFailure {
                    id: exchange.id,
                    timestamp: exchange.timestamp,
                    message: e.to_string(),
                    request_body,
                };
                on_failure(&failure);
                report.failures.push(failure);

                if !options.continue_on_error {
                    report.halted = true;
                    break;
                }
            }
        }

        let done = report.processed();
        if done % 500 == 0 {
            tracing::info!("Indexed {} exchanges so far", done);
        }
    }

    report.log_summary();
    Ok(report)
}
