use crate::constants::{DEFAULT_DATABASE_PATH, ENV_DATABASE, ENV_LOG_DIR, ENV_TOKENIZER};
use crate::scheduler::IndexMode;
use crate::token_counting::TokenEstimator;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Index and query captured model API traffic", long_about = None)]
pub struct Args {
    #[arg(long, global = true, env = ENV_DATABASE, default_value = DEFAULT_DATABASE_PATH)]
    pub database: PathBuf,
    /// Path to a tokenizer.json for exact counts; approximate counts without one.
    #[arg(long, global = true, env = ENV_TOKENIZER)]
    pub tokenizer: Option<PathBuf>,
    #[arg(long, global = true, env = ENV_LOG_DIR, default_value = "logs")]
    pub log_dir: PathBuf,
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Index captured exchanges (new ones since the last run unless --recreate).
    Index {
        /// Clear the index and rebuild it from every captured exchange.
        #[arg(long, default_value_t = false)]
        recreate: bool,
        #[arg(long, default_value_t = false)]
        continue_on_error: bool,
        /// Print the request body of each exchange that fails.
        #[arg(long, default_value_t = false)]
        debug: bool,
    },
    /// List exchanges that share a context prefix with the given one.
    FindConversations {
        /// Exchange to start from; defaults to the most recently indexed one.
        #[arg(long)]
        id: Option<String>,
    },
    /// Print one stored message as JSON.
    ShowMessage { id: i64 },
    /// List indexed exchanges in a time range.
    Turns {
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },
}

impl Args {
    pub fn build_estimator(&self) -> TokenEstimator {
        TokenEstimator::from_tokenizer_file(self.tokenizer.as_deref())
    }
}

/// A rebuild was asked for, or there is nothing to be incremental against.
pub fn resolve_index_mode(recreate: bool, index_empty: bool) -> IndexMode {
    if recreate || index_empty {
        IndexMode::Full
    } else {
        IndexMode::Incremental
    }
}
