// SSE transcoding from Gemini stream events to OpenAI chunks

use axum::response::sse::Event;
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::fmt::Display;

use super::translator::ClientFormat;

const DONE: &str = "[DONE]";

/// One incremental unit decoded from an upstream event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamChunk {
    pub content_delta: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    /// Not a data line, empty, or unparseable.
    Ignore,
    /// Termination sentinel.
    Done,
    Chunk(StreamChunk),
}

pub fn parse_stream_line(line: &str) -> StreamLine {
    let Some(data) = line.strip_prefix("data:") else {
        return StreamLine::Ignore;
    };
    let data = data.trim();
    if data.is_empty() {
        return StreamLine::Ignore;
    }
    if data == DONE {
        return StreamLine::Done;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(value) => StreamLine::Chunk(extract_chunk(&value)),
        Err(e) => {
            tracing::debug!("Skipping unparseable stream chunk ({}): {}", e, data);
            StreamLine::Ignore
        }
    }
}

/// Missing paths yield an empty delta rather than an error.
fn extract_chunk(value: &Value) -> StreamChunk {
    // Some Gemini front-ends wrap the payload in `response`
    let data = value.get("response").unwrap_or(value);
    let candidate = data.get("candidates").and_then(|c| c.get(0));

    let content_delta = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter(|p| !p.get("thought").and_then(|t| t.as_bool()).unwrap_or(false))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default();

    let finish_reason = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|r| r.as_str())
        .map(map_finish_reason);

    StreamChunk {
        content_delta,
        finish_reason,
    }
}

pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            "content_filter".to_string()
        }
        other => other.to_lowercase(),
    }
}

/// Encodes chunks for one stream. The id and creation time are fixed at
/// construction and repeated on every chunk.
#[derive(Debug, Clone)]
pub struct ChunkEncoder {
    id: String,
    model: String,
    created: i64,
    format: ClientFormat,
    sent_first: bool,
}

impl ChunkEncoder {
    pub fn new(model: impl Into<String>, format: ClientFormat) -> Self {
        Self {
            id: format.new_response_id(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            format,
            sent_first: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn encode(&mut self, chunk: &StreamChunk) -> String {
        let value = match self.format {
            ClientFormat::Chat => {
                let mut delta = json!({ "content": chunk.content_delta });
                if !self.sent_first {
                    delta["role"] = json!("assistant");
                }
                json!({
                    "id": self.id,
                    "object": "chat.completion.chunk",
                    "created": self.created,
                    "model": self.model,
                    "choices": [{
                        "index": 0,
                        "delta": delta,
                        "finish_reason": chunk.finish_reason
                    }]
                })
            }
            ClientFormat::Completion => json!({
                "id": self.id,
                "object": "text_completion",
                "created": self.created,
                "model": self.model,
                "choices": [{
                    "text": chunk.content_delta,
                    "index": 0,
                    "logprobs": null,
                    "finish_reason": chunk.finish_reason
                }]
            }),
        };
        self.sent_first = true;
        value.to_string()
    }
}

/// Called with the concatenated delta text after a clean end of stream.
pub type CompletionHook = Box<dyn FnOnce(String) + Send + 'static>;

/// Re-encode an upstream SSE byte stream as client event payloads.
///
/// Each upstream data line is forwarded as soon as it is complete. The
/// output always ends with exactly one `[DONE]`, including when the upstream
/// fails mid-stream; the hook only runs when the stream ended cleanly.
/// Dropping the returned stream drops the upstream reader.
pub fn transcode<S, B, E>(
    upstream: S,
    mut encoder: ChunkEncoder,
    on_complete: Option<CompletionHook>,
) -> impl Stream<Item = String> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut upstream = Box::pin(upstream);
        let mut buffer: Vec<u8> = Vec::new();
        let mut accumulated = String::new();
        let mut clean = true;
        let mut saw_sentinel = false;

        'read: while let Some(item) = upstream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("Upstream stream {} ended with error: {}", encoder.id(), e);
                    clean = false;
                    break;
                }
            };
            buffer.extend_from_slice(bytes.as_ref());

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                match parse_stream_line(line.trim_end_matches(['\r', '\n'])) {
                    StreamLine::Ignore => {}
                    StreamLine::Done => {
                        saw_sentinel = true;
                        break 'read;
                    }
                    StreamLine::Chunk(chunk) => {
                        if on_complete.is_some() {
                            accumulated.push_str(&chunk.content_delta);
                        }
                        yield encoder.encode(&chunk);
                    }
                }
            }
        }

        // Upstream closed without a trailing newline
        if clean && !saw_sentinel && !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).into_owned();
            if let StreamLine::Chunk(chunk) = parse_stream_line(line.trim_end_matches('\r')) {
                if on_complete.is_some() {
                    accumulated.push_str(&chunk.content_delta);
                }
                yield encoder.encode(&chunk);
            }
        }

        if clean {
            if let Some(hook) = on_complete {
                hook(accumulated);
            }
        }

        yield DONE.to_string();
    }
}

/// Wrap payloads as SSE `data:` events.
pub fn into_events<S>(payloads: S) -> impl Stream<Item = Result<Event, Infallible>>
where
    S: Stream<Item = String>,
{
    payloads.map(|payload| Ok(Event::default().data(payload)))
}
