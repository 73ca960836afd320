//! Token Counting Utility
//!
//! Advisory token estimates for stored messages, system prompts and tool
//! definitions. The counter is injected. Out of the box it approximates a
//! byte-level BPE from its pre-tokenizer splits; a `tokenizer.json` gives exact
//! counts for that vocabulary, and a vocabulary that fails to load makes every
//! estimate zero.

use crate::constants::{PIECE_BYTES_PER_TOKEN, SINGLE_TOKEN_PIECE_BYTES};
use crate::types::{Result, TurnlogError};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::{OffsetReferential, OffsetType, PreTokenizedString, PreTokenizer};

/// Anything that can turn text into a token count.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Counter backed by a HuggingFace `tokenizer.json` (any BPE vocabulary works).
pub struct HfTokenCounter {
    tokenizer: tokenizers::Tokenizer,
}

impl HfTokenCounter {
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            TurnlogError::Tokenizer(format!("failed to load {}: {}", path.display(), e))
        })?;
        Ok(Self { tokenizer })
    }
}

impl TokenCounter for HfTokenCounter {
    fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.len(),
            Err(e) => {
                tracing::debug!("Tokenizer failed on {} bytes: {}", text.len(), e);
                0
            }
        }
    }
}

/// Vocabulary-free counter built on the GPT-style byte-level pre-tokenizer.
///
/// Each split piece (a word with its leading space, a digit run, a punctuation
/// run) costs one token up to [`SINGLE_TOKEN_PIECE_BYTES`]; longer pieces cost
/// one more token per [`PIECE_BYTES_PER_TOKEN`] bytes.
pub struct PreTokenCounter {
    splitter: ByteLevel,
}

impl Default for PreTokenCounter {
    fn default() -> Self {
        Self {
            splitter: ByteLevel::new(false, false, true),
        }
    }
}

impl PreTokenCounter {
    fn piece_cost(bytes: usize) -> usize {
        1 + bytes
            .saturating_sub(SINGLE_TOKEN_PIECE_BYTES)
            .div_ceil(PIECE_BYTES_PER_TOKEN)
    }
}

impl TokenCounter for PreTokenCounter {
    fn count(&self, text: &str) -> usize {
        let mut pretokenized = PreTokenizedString::from(text);
        if let Err(e) = self.splitter.pre_tokenize(&mut pretokenized) {
            tracing::debug!("Pre-tokenizer failed on {} bytes: {}", text.len(), e);
            return (text.len() / 3).max(1);
        }
        pretokenized
            .get_splits(OffsetReferential::Original, OffsetType::None)
            .into_iter()
            // byte-level pieces carry one char per original byte
            .map(|(piece, _, _)| Self::piece_cost(piece.chars().count()))
            .sum()
    }
}

/// Estimator for message, system and tool token counts.
#[derive(Clone, Default)]
pub struct TokenEstimator {
    counter: Option<Arc<dyn TokenCounter>>,
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl TokenEstimator {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            counter: Some(counter),
        }
    }

    /// An estimator that reports zero for everything.
    pub fn disabled() -> Self {
        Self { counter: None }
    }

    /// The built-in approximate counter.
    pub fn approximate() -> Self {
        Self::new(Arc::new(PreTokenCounter::default()))
    }

    /// Loads the tokenizer at `path`, or the built-in counter when none is given.
    /// A load failure is logged once here and yields a disabled estimator.
    pub fn from_tokenizer_file(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            tracing::info!("No tokenizer configured, using approximate token counts");
            return Self::approximate();
        };
        match HfTokenCounter::from_file(path) {
            Ok(counter) => {
                tracing::info!("Loaded tokenizer from {}", path.display());
                Self::new(Arc::new(counter))
            }
            Err(e) => {
                tracing::warn!("Failed to initialize tokenizer, token estimates will be 0: {}", e);
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.counter.is_some()
    }

    fn count(&self, text: &str) -> i64 {
        match &self.counter {
            Some(c) if !text.is_empty() => c.count(text) as i64,
            _ => 0,
        }
    }

    /// Estimate for a canonical message in its serialized form.
    pub fn estimate(&self, canonical: &str) -> i64 {
        if !self.is_enabled() {
            return 0;
        }
        match serde_json::from_str::<Value>(canonical) {
            Ok(message) => self.estimate_message(&message),
            Err(_) => 0,
        }
    }

    /// Sums text, thinking and tool-result strings plus serialized tool inputs.
    pub fn estimate_message(&self, message: &Value) -> i64 {
        if !self.is_enabled() {
            return 0;
        }
        match message.get("content") {
            Some(Value::String(text)) => self.count(text),
            Some(Value::Array(blocks)) => blocks.iter().map(|b| self.estimate_block(b)).sum(),
            _ => 0,
        }
    }

    fn estimate_block(&self, block: &Value) -> i64 {
        let Some(fields) = block.as_object() else {
            return 0;
        };
        let mut total = 0;
        for (key, val) in fields {
            match (key.as_str(), val) {
                ("text" | "thinking" | "content", Value::String(s)) => total += self.count(s),
                // tool_result content may itself be a list of blocks
                ("content", Value::Array(inner)) => {
                    total += inner.iter().map(|b| self.estimate_block(b)).sum::<i64>()
                }
                ("input", input) => total += self.count(&input.to_string()),
                _ => {}
            }
        }
        total
    }

    /// System prompt: a bare string or a list of `{text}` blocks.
    pub fn estimate_system(&self, system: Option<&Value>) -> i64 {
        match system {
            Some(Value::String(s)) => self.count(s),
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .map(|t| self.count(t))
                .sum(),
            _ => 0,
        }
    }

    /// Tool definitions are tokenized as one serialized blob.
    pub fn estimate_tools(&self, tools: Option<&Value>) -> i64 {
        match tools {
            None | Some(Value::Null) => 0,
            Some(t) => self.count(&t.to_string()),
        }
    }
}
