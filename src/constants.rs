/// Database defaults
pub const DB_BUSY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_DATABASE_PATH: &str = "requests.db";

/// How far before the newest indexed exchange an incremental run looks again,
/// so responses that completed after the previous run get picked up.
pub const INCREMENTAL_LOOKBACK: &str = "-10 minutes";

/// Context lists up to this length are shown in full.
pub const CONTEXT_DISPLAY_FULL_MAX: usize = 6;
pub const CONTEXT_DISPLAY_HEAD: usize = 2;
pub const CONTEXT_DISPLAY_TAIL: usize = 4;

/// Prefix carried by every captured SSE chunk.
pub const SSE_DATA_PREFIX: &str = "data: ";

/// Default request endpoint recorded by the capture layer.
pub const MESSAGES_ENDPOINT: &str = "/v1/messages";

/// Environment variables
pub const ENV_DATABASE: &str = "TURNLOG_DB";
pub const ENV_TOKENIZER: &str = "TURNLOG_TOKENIZER";
pub const ENV_LOG_DIR: &str = "TURNLOG_LOG_DIR";

/// Logging
pub const LOG_FILE_PREFIX: &str = "turnlog.log";
pub const LOG_MAX_FILES: usize = 7;
pub const DEFAULT_LOG_FILTER: &str = "turnlog=info";

/// Truncation limits when echoing request bodies in `index --debug`.
pub const DEBUG_BODY_RAW_CHARS: usize = 500;
pub const DEBUG_BODY_PRETTY_CHARS: usize = 2000;

/// Built-in token approximation: pieces up to this many bytes are one token,
/// longer ones pay one more token per `PIECE_BYTES_PER_TOKEN` bytes.
pub const SINGLE_TOKEN_PIECE_BYTES: usize = 6;
pub const PIECE_BYTES_PER_TOKEN: usize = 4;
