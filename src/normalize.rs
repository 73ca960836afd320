//! Canonical message form used as the dedup key.
//!
//! A message is reduced to `{role, content}` with string content promoted to a
//! single text block and `cache_control` hints stripped from every block. Keys
//! are emitted in sorted order at every depth so the serialized bytes are
//! stable regardless of how the capture layer ordered them.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Normalizes one raw message. Input that is not a JSON object comes back unchanged.
pub fn normalize_message(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.is_object() => canonical_bytes(&value),
        _ => raw.to_string(),
    }
}

/// Canonical serialization of an already-parsed message.
pub fn canonical_bytes(message: &Value) -> String {
    match normalize_value(message) {
        Some(normalized) => normalized.to_string(),
        None => message.to_string(),
    }
}

/// Returns the normalized `{role, content}` object, or `None` if `message` is not an object.
pub fn normalize_value(message: &Value) -> Option<Value> {
    let obj = message.as_object()?;
    let mut out = Map::new();

    if let Some(content) = obj.get("content") {
        out.insert("content".to_string(), normalize_content(content));
    }
    if let Some(role) = obj.get("role") {
        out.insert("role".to_string(), role.clone());
    }

    Some(sort_keys(Value::Object(out)))
}

fn normalize_content(content: &Value) -> Value {
    match content {
        Value::String(text) => {
            let mut block = Map::new();
            block.insert("text".to_string(), Value::String(text.clone()));
            block.insert("type".to_string(), Value::String("text".to_string()));
            Value::Array(vec![Value::Object(block)])
        }
        Value::Array(blocks) => Value::Array(
            blocks
                .iter()
                .map(|block| match block {
                    Value::Object(fields) => {
                        let mut fields = fields.clone();
                        fields.remove("cache_control");
                        Value::Object(fields)
                    }
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

// Rebuilding each map with keys inserted in order keeps the output sorted even
// when serde_json is built with `preserve_order`.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Hex SHA-256 of the canonical bytes.
pub fn content_hash(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Comma-joined block types of a message's content; bare string content is `text`.
pub fn compute_signature(content: &Value) -> String {
    match content {
        Value::Array(blocks) => blocks
            .iter()
            .map(|b| block_type(b).to_string())
            .collect::<Vec<_>>()
            .join(","),
        Value::String(_) => "text".to_string(),
        _ => String::new(),
    }
}

/// Like [`compute_signature`], but names the tool on `tool_use` blocks (`tool_use=Read`).
pub fn response_signature(blocks: &[Value]) -> Option<String> {
    if blocks.is_empty() {
        return None;
    }
    let tags = blocks.iter().map(detailed_tag).collect::<Vec<_>>();
    Some(tags.join(","))
}

pub(crate) fn detailed_tag(block: &Value) -> String {
    let kind = block_type(block);
    if kind == "tool_use" {
        if let Some(name) = block.get("name").and_then(|n| n.as_str()) {
            if !name.is_empty() {
                return format!("tool_use={}", name);
            }
        }
    }
    kind.to_string()
}

fn block_type(block: &Value) -> &str {
    block.get("type").and_then(|t| t.as_str()).unwrap_or("")
}
