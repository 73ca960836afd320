use clap::Parser;
use colored::*;
use turnlog::constants::{DEBUG_BODY_PRETTY_CHARS, DEBUG_BODY_RAW_CHARS};
use turnlog::db::{clear_index, index_is_empty, index_totals, init_db, DbPool};
use turnlog::indexer::Indexer;
use turnlog::main_helper::{resolve_index_mode, Args, Command};
use turnlog::scheduler::{run_batch, BatchFailure, BatchOptions, IndexMode};
use turnlog::str_utils::{truncate_end, truncate_start};
use turnlog::types::{ExchangeId, MessageId, Result, TurnlogError};
use turnlog::{logging, query, store};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let _guard = match logging::init_tracing(&args.log_dir, args.log_json) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };
    logging::setup_panic_hook();

    let pool = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = match &args.command {
        Command::Index {
            recreate,
            continue_on_error,
            debug,
        } => run_index(&args, pool, *recreate, *continue_on_error, *debug).await,
        Command::FindConversations { id } => run_find_conversations(&pool, id.clone()).await,
        Command::ShowMessage { id } => run_show_message(&pool, MessageId(*id)).await,
        Command::Turns { start, end } => {
            run_turns(&pool, start.as_deref(), end.as_deref()).await
        }
    };

    if let Err(e) = outcome {
        tracing::debug!("{}", e.with_trace());
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run_index(
    args: &Args,
    pool: DbPool,
    recreate: bool,
    continue_on_error: bool,
    debug: bool,
) -> Result<()> {
    let mode = resolve_index_mode(recreate, index_is_empty(&pool).await?);
    match mode {
        IndexMode::Full => {
            if recreate {
                clear_index(&pool).await?;
            }
            println!("Indexing all requests...");
        }
        IndexMode::Incremental => println!("Indexing new requests since last run..."),
    }

    let indexer = Indexer::new(pool.clone(), args.build_estimator());
    let options = BatchOptions {
        mode,
        continue_on_error,
        capture_bodies: debug,
    };
    let report = run_batch(&indexer, options, |failure| print_failure(failure, debug)).await?;

    if report.processed() == 0 {
        println!("No new requests to index.");
        return Ok(());
    }

    let summary = format!(
        "Processed: {} successful, {} errors",
        report.succeeded + report.skipped,
        report.failed
    );
    if report.halted {
        eprintln!("\n{}", summary);
        eprintln!(
            "\n{}",
            "Stopping at first error. Use --continue-on-error to process all rows.".yellow()
        );
        let reason = report
            .failures
            .last()
            .map(|f| format!("indexing {} failed: {}", f.id, f.message))
            .unwrap_or_else(|| "indexing halted".to_string());
        return Err(TurnlogError::Internal(reason, tracing_error::SpanTrace::capture()).into());
    }
    println!("\n{}", summary);

    let totals = index_totals(&pool).await?;
    logging::log_index_totals(&totals);
    println!("Total: {} message rows indexed", totals.positions);
    println!("Unique message content: {}", totals.unique_messages);
    Ok(())
}

fn print_failure(failure: &BatchFailure, debug: bool) {
    eprintln!(
        "{} id={} ts={}",
        "ERROR processing".red(),
        failure.id,
        failure.timestamp
    );
    eprintln!("  {}", failure.message);
    if !debug {
        return;
    }
    match &failure.request_body {
        Some(body) => match serde_json::from_str::<serde_json::Value>(body) {
            Ok(parsed) => {
                let pretty = serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| body.clone());
                eprintln!("  Body:\n  {}", truncate_end(&pretty, DEBUG_BODY_PRETTY_CHARS));
            }
            Err(_) => eprintln!(
                "  Body (raw, first {} chars): {}",
                DEBUG_BODY_RAW_CHARS,
                truncate_end(body, DEBUG_BODY_RAW_CHARS)
            ),
        },
        None => eprintln!("  Could not fetch body"),
    }
}

async fn run_find_conversations(pool: &DbPool, id: Option<String>) -> Result<()> {
    let id = match id {
        Some(id) => ExchangeId(id),
        None => match query::latest_exchange_id(pool).await? {
            Some(id) => id,
            None => return Err(TurnlogError::NotFound("no indexed exchanges".to_string()).into()),
        },
    };

    let related = query::find_related(pool, &id).await?;

    println!("{} {}:", related.anchor_timestamp, related.anchor);
    println!(
        "  {}",
        format!(
            "{:<26} {:<18} {:<40} {:>6} {:<12} {:<10}",
            "Timestamp", "Id", "Context", "Size", "LastId", "Streaming"
        )
        .bold()
    );
    for r in &related.matches {
        let streaming = match r.streaming {
            Some(true) => "yes",
            Some(false) => "no",
            None => "",
        };
        println!(
            "  {:<26} {:<18} {:<40} {:>6} {:<12} {:<10}",
            r.timestamp,
            r.id.short(),
            truncate_start(&r.context.to_storage_string(), 40),
            r.context.len(),
            r.last_message_id,
            streaming
        );
    }
    println!("\nFound {} requests matching prefix", related.matches.len());
    Ok(())
}

async fn run_show_message(pool: &DbPool, id: MessageId) -> Result<()> {
    let message = store::get_message(pool, id).await?;
    println!("{}", serde_json::to_string_pretty(&message)?);
    Ok(())
}

async fn run_turns(pool: &DbPool, start: Option<&str>, end: Option<&str>) -> Result<()> {
    let rows = query::list_exchanges(pool, start, end).await?;

    println!(
        "{}",
        format!(
            "{:<26} {:<10} {:<28} {:>4} {:<24} {:<24} {:<12} {:>8} {:>7} {:>7}",
            "Timestamp", "Id", "Context", "Msgs", "Trigger", "Response", "Stop", "CtxTok", "LastTok", "RespTok"
        )
        .bold()
    );
    for row in &rows {
        let ex = &row.exchange;
        let trigger = format!(
            "{}:{}",
            row.trigger_role.as_deref().unwrap_or("?"),
            row.trigger_signature.as_deref().unwrap_or("")
        );
        println!(
            "{:<26} {:<10} {:<28} {:>4} {:<24} {:<24} {:<12} {:>8} {:>7} {:>7}",
            ex.timestamp,
            ex.id.short(),
            truncate_start(&row.context_display, 28),
            row.message_count,
            truncate_end(&trigger, 21),
            truncate_end(ex.response.response_signature.as_deref().unwrap_or("-"), 21),
            ex.response.stop_reason.as_deref().unwrap_or("-"),
            row.context_tokens,
            row.last_message_tokens,
            row.response_tokens
        );
    }
    println!("\n{} turns", rows.len());
    Ok(())
}
