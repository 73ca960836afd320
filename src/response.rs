//! Rebuilds the assistant reply from a captured response.
//!
//! A capture holds either a buffered body (`body: {role, content, stop_reason, id}`)
//! or the raw SSE chunks of a streamed reply (`streamingChunks: ["data: {...}", ...]`).
//! Both are reduced to one `{role, content}` message plus [`ResponseMetadata`].
//! Nothing in here fails: unusable input yields `None` fields.

use crate::constants::SSE_DATA_PREFIX;
use crate::normalize::{detailed_tag, response_signature};
use crate::types::ResponseMetadata;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// One streamed event, parsed once.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        id: Option<String>,
        role: Option<String>,
    },
    BlockStart {
        index: usize,
        block: Value,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    ThinkingDelta {
        index: usize,
        thinking: String,
    },
    SignatureDelta {
        index: usize,
        signature: String,
    },
    ToolInputDelta {
        index: usize,
        partial_json: String,
    },
    MessageDelta {
        stop_reason: Option<String>,
    },
    Unknown,
}

// --- WIRE TYPES ---

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        #[serde(default)]
        message: Value,
    },
    ContentBlockStart {
        index: usize,
        content_block: Value,
    },
    ContentBlockDelta {
        index: usize,
        delta: WireDelta,
    },
    MessageDelta {
        #[serde(default)]
        delta: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta {
        #[serde(default)]
        text: String,
    },
    ThinkingDelta {
        #[serde(default)]
        thinking: String,
    },
    SignatureDelta {
        #[serde(default)]
        signature: String,
    },
    InputJsonDelta {
        #[serde(default)]
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

fn non_empty_str(v: Option<&Value>) -> Option<String> {
    match v.and_then(|s| s.as_str()) {
        Some(s) if !s.is_empty() => Some(s.to_string()),
        _ => None,
    }
}

/// Strips the SSE framing from a captured chunk and returns the JSON payload.
fn chunk_payload(chunk: &str) -> &str {
    for line in chunk.lines() {
        if let Some(data) = line.strip_prefix(SSE_DATA_PREFIX) {
            return data.trim();
        }
    }
    chunk.trim()
}

pub fn parse_stream_chunk(chunk: &str) -> StreamEvent {
    let data = chunk_payload(chunk);
    let wire = match serde_json::from_str::<WireEvent>(data) {
        Ok(w) => w,
        Err(e) => {
            tracing::debug!(
                "[STREAM] Unparseable chunk ({}): {}",
                e,
                crate::str_utils::truncate_end(data, 200)
            );
            return StreamEvent::Unknown;
        }
    };

    match wire {
        WireEvent::MessageStart { message } => StreamEvent::MessageStart {
            id: non_empty_str(message.get("id")),
            role: non_empty_str(message.get("role")),
        },
        WireEvent::ContentBlockStart {
            index,
            content_block,
        } => StreamEvent::BlockStart {
            index,
            block: content_block,
        },
        WireEvent::ContentBlockDelta { index, delta } => match delta {
            WireDelta::TextDelta { text } => StreamEvent::TextDelta { index, text },
            WireDelta::ThinkingDelta { thinking } => StreamEvent::ThinkingDelta { index, thinking },
            WireDelta::SignatureDelta { signature } => {
                StreamEvent::SignatureDelta { index, signature }
            }
            WireDelta::InputJsonDelta { partial_json } => StreamEvent::ToolInputDelta {
                index,
                partial_json,
            },
            WireDelta::Other => StreamEvent::Unknown,
        },
        WireEvent::MessageDelta { delta } => StreamEvent::MessageDelta {
            stop_reason: non_empty_str(delta.get("stop_reason")),
        },
        WireEvent::Other => StreamEvent::Unknown,
    }
}

/// A content block being assembled from deltas.
#[derive(Debug, Clone)]
struct BlockBuffer {
    kind: String,
    start: Value,
    text: String,
    thinking: String,
    signature: String,
    /// Raw `input_json_delta` fragments, parsed once at finalization.
    input_json: String,
}

impl BlockBuffer {
    fn from_start(block: Value) -> Self {
        let field = |k: &str| {
            block
                .get(k)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        Self {
            kind: field("type"),
            text: field("text"),
            thinking: field("thinking"),
            signature: field("signature"),
            input_json: String::new(),
            start: block,
        }
    }

    fn finalize(self) -> Value {
        match self.kind.as_str() {
            "text" => json!({"type": "text", "text": self.text}),
            "thinking" => {
                let mut block = json!({"type": "thinking", "thinking": self.thinking});
                if !self.signature.is_empty() {
                    block["signature"] = Value::String(self.signature);
                }
                block
            }
            "tool_use" => {
                let input = if self.input_json.trim().is_empty() {
                    match self.start.get("input") {
                        Some(v) => v.clone(),
                        None => json!({}),
                    }
                } else {
                    match serde_json::from_str::<Value>(&self.input_json) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::debug!("[FINALIZE] Tool input is not valid JSON, keeping raw: {}", e);
                            Value::String(self.input_json)
                        }
                    }
                };
                json!({
                    "type": "tool_use",
                    "id": self.start.get("id").cloned().unwrap_or(Value::String(String::new())),
                    "name": self.start.get("name").cloned().unwrap_or(Value::String(String::new())),
                    "input": input,
                })
            }
            _ => self.start,
        }
    }
}

/// Replays stream events into content blocks keyed by their `index`.
#[derive(Debug, Default, Clone)]
pub struct StreamAccumulator {
    /// Sparse: indices come off the wire and are not trusted to be dense.
    blocks: BTreeMap<usize, BlockBuffer>,
    tags: Vec<String>,
    stop_reason: Option<String>,
    response_id: Option<String>,
    role: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replay<'a, I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut acc = Self::new();
        for chunk in chunks {
            acc.push(parse_stream_chunk(chunk));
        }
        acc
    }

    fn block_mut(&mut self, index: usize) -> Option<&mut BlockBuffer> {
        self.blocks.get_mut(&index)
    }

    pub fn push(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::MessageStart { id, role } => {
                if self.response_id.is_none() {
                    self.response_id = id;
                }
                if self.role.is_none() {
                    self.role = role;
                }
            }
            StreamEvent::BlockStart { index, block } => {
                self.tags.push(detailed_tag(&block));
                self.blocks.insert(index, BlockBuffer::from_start(block));
            }
            StreamEvent::TextDelta { index, text } => {
                if let Some(b) = self.block_mut(index) {
                    b.text.push_str(&text);
                }
            }
            StreamEvent::ThinkingDelta { index, thinking } => {
                if let Some(b) = self.block_mut(index) {
                    b.thinking.push_str(&thinking);
                }
            }
            StreamEvent::SignatureDelta { index, signature } => {
                if let Some(b) = self.block_mut(index) {
                    b.signature.push_str(&signature);
                }
            }
            StreamEvent::ToolInputDelta {
                index,
                partial_json,
            } => {
                if let Some(b) = self.block_mut(index) {
                    b.input_json.push_str(&partial_json);
                }
            }
            StreamEvent::MessageDelta { stop_reason } => {
                if self.stop_reason.is_none() {
                    self.stop_reason = stop_reason;
                }
            }
            StreamEvent::Unknown => {}
        }
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// Block tags in the order their `content_block_start` events arrived.
    pub fn signature(&self) -> Option<String> {
        if self.tags.is_empty() {
            None
        } else {
            Some(self.tags.join(","))
        }
    }

    /// The reconstructed assistant message, or `None` when no block was started.
    pub fn finalize(self) -> Option<Value> {
        let content: Vec<Value> = self
            .blocks
            .into_values()
            .map(BlockBuffer::finalize)
            .collect();
        if content.is_empty() {
            return None;
        }
        Some(json!({"role": "assistant", "content": content}))
    }
}

/// The assistant reply (if any) and the response-level fields of one capture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciledResponse {
    pub message: Option<Value>,
    pub metadata: ResponseMetadata,
}

/// Pulls `{role, content}` out of a buffered body, rejecting empty replies.
pub fn extract_buffered_message(body: &Value) -> Option<Value> {
    let role = non_empty_str(body.get("role"))?;
    let content = body.get("content")?;
    let empty = match content {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    };
    if empty {
        return None;
    }
    Some(json!({"role": role, "content": content.clone()}))
}

pub fn reconcile_response(raw: &str) -> ReconciledResponse {
    match serde_json::from_str::<Value>(raw) {
        Ok(v) => reconcile_response_value(&v),
        Err(e) => {
            tracing::debug!("Response is not valid JSON, leaving response fields empty: {}", e);
            ReconciledResponse::default()
        }
    }
}

pub fn reconcile_response_value(response: &Value) -> ReconciledResponse {
    let mut out = ReconciledResponse::default();
    let Some(fields) = response.as_object() else {
        return out;
    };

    let meta = &mut out.metadata;
    meta.status_code = fields
        .get("statusCode")
        .and_then(|s| s.as_i64())
        .filter(|s| *s != 0);
    meta.streaming = Some(
        fields
            .get("isStreaming")
            .and_then(|s| s.as_bool())
            .unwrap_or(false),
    );

    if let Some(body) = fields.get("body").filter(|b| b.is_object()) {
        meta.stop_reason = non_empty_str(body.get("stop_reason"));
        meta.response_id = non_empty_str(body.get("id"));
        meta.response_role = non_empty_str(body.get("role"));
        if let Some(blocks) = body.get("content").and_then(|c| c.as_array()) {
            meta.response_signature = response_signature(blocks);
        }
        out.message = extract_buffered_message(body);
    }

    let chunks: Vec<&str> = match fields.get("streamingChunks").and_then(|c| c.as_array()) {
        Some(items) => items.iter().filter_map(|c| c.as_str()).collect(),
        None => Vec::new(),
    };
    let needs_stream = out.message.is_none()
        || meta.response_signature.is_none()
        || meta.stop_reason.is_none()
        || meta.response_id.is_none()
        || meta.response_role.is_none();

    if !chunks.is_empty() && needs_stream {
        let acc = StreamAccumulator::replay(chunks);
        if meta.response_signature.is_none() {
            meta.response_signature = acc.signature();
        }
        if meta.stop_reason.is_none() {
            meta.stop_reason = acc.stop_reason.clone();
        }
        if meta.response_id.is_none() {
            meta.response_id = acc.response_id.clone();
        }
        if meta.response_role.is_none() {
            meta.response_role = acc.role.clone();
        }
        if out.message.is_none() {
            out.message = acc.finalize();
        }
    }

    out
}
