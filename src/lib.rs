#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod capture;
pub mod constants;
pub mod db;
pub mod indexer;
pub mod logging;
pub mod main_helper;
pub mod normalize;
pub mod query;
pub mod response;
pub mod scheduler;
pub mod store;
pub mod str_utils;
pub mod token_counting;
pub mod types;

pub use types::*;

pub use indexer::{IndexOutcome, Indexer};
pub use main_helper::Args;
