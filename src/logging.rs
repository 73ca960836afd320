use crate::constants::{DEFAULT_LOG_FILTER, LOG_FILE_PREFIX, LOG_MAX_FILES};
use crate::db::IndexTotals;
use crate::types::{Result, TurnlogError};
use std::panic;
use std::path::Path;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Sets up a global panic hook that logs panics through tracing before the default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Installs the global subscriber: env filter, stderr output, a daily rolling
/// file under `log_dir`, and the span-trace error layer.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init_tracing(log_dir: &Path, json: bool) -> Result<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    std::fs::create_dir_all(log_dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(LOG_MAX_FILES)
        .build(log_dir)
        .map_err(|e| {
            TurnlogError::Internal(
                format!("failed to open log directory {}: {}", log_dir.display(), e),
                tracing_error::SpanTrace::capture(),
            )
        })?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let json_file = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(file_writer.clone())
    });
    let text_file = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(json_file)
        .with(text_file)
        .with(tracing_error::ErrorLayer::default())
        .init();

    Ok(guard)
}

pub fn log_index_totals(totals: &IndexTotals) {
    info!(
        target: "turnlog::index",
        "[INDEX] {} exchanges | {} position rows | {} unique messages",
        totals.exchanges, totals.positions, totals.unique_messages
    );
}
