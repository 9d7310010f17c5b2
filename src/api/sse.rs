use super::{ApiChunk, ApiError, UsageChunk};
use serde::Deserialize;
use tracing::warn;

/// Incremental SSE framing parser for the Anthropic messages stream.
///
/// Bytes are accumulated until a complete `\n\n`-terminated event is
/// available; each event's `data:` payload is decoded and mapped onto the
/// engine's chunk vocabulary. Unknown event types are skipped so protocol
/// additions never break the stream.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, chunk: &[u8]) -> Result<Vec<ApiChunk>, ApiError> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut chunks = Vec::new();
        let mut start = 0;

        while let Some(end) = self.buffer[start..].find("\n\n") {
            let event_end = start + end + 2;
            let event_text = &self.buffer[start..event_end];

            let mut data = None;
            for line in event_text.lines() {
                if let Some(rest) = line.strip_prefix("data: ") {
                    data = Some(rest.trim().to_string());
                }
            }

            if let Some(json_data) = data {
                if json_data == "[DONE]" {
                    start = event_end;
                    continue;
                }

                match serde_json::from_str::<WireEvent>(&json_data) {
                    Ok(event) => {
                        if let Some(mapped) = map_wire_event(event)? {
                            chunks.push(mapped);
                        }
                    }
                    Err(error) => {
                        warn!(%error, data = %json_data, "dropping unparseable SSE event");
                    }
                }
            }

            start = event_end;
        }

        if start > 0 {
            self.buffer.drain(..start);
        }

        Ok(chunks)
    }
}

fn map_wire_event(event: WireEvent) -> Result<Option<ApiChunk>, ApiError> {
    match event {
        WireEvent::MessageStart { message } => {
            let usage = message.usage.unwrap_or_default();
            Ok(Some(ApiChunk::Usage(UsageChunk {
                tokens_in: usage.input_tokens.unwrap_or(0),
                tokens_out: usage.output_tokens.unwrap_or(0),
                cache_writes: usage.cache_creation_input_tokens.unwrap_or(0),
                cache_reads: usage.cache_read_input_tokens.unwrap_or(0),
                cost: usage.cost,
            })))
        }
        WireEvent::ContentBlockDelta { delta, .. } => match delta.delta_type.as_str() {
            "text_delta" => Ok(delta.text.map(ApiChunk::Text)),
            "thinking_delta" => Ok(delta.thinking.map(ApiChunk::Reasoning)),
            _ => Ok(None),
        },
        WireEvent::MessageDelta { usage } => {
            let usage = usage.unwrap_or_default();
            if usage.output_tokens.is_none() && usage.cost.is_none() {
                return Ok(None);
            }
            Ok(Some(ApiChunk::Usage(UsageChunk {
                tokens_in: usage.input_tokens.unwrap_or(0),
                tokens_out: usage.output_tokens.unwrap_or(0),
                cache_writes: usage.cache_creation_input_tokens.unwrap_or(0),
                cache_reads: usage.cache_read_input_tokens.unwrap_or(0),
                cost: usage.cost,
            })))
        }
        WireEvent::Error { error } => Err(classify_stream_error(&error)),
        WireEvent::ContentBlockStart { .. }
        | WireEvent::ContentBlockStop { .. }
        | WireEvent::MessageStop
        | WireEvent::Ping
        | WireEvent::Unknown => Ok(None),
    }
}

fn classify_stream_error(error: &WireError) -> ApiError {
    let kind = error.error_type.as_deref().unwrap_or("");
    let message = error
        .message
        .clone()
        .unwrap_or_else(|| "stream error".to_string());

    if kind.contains("overloaded") || kind.contains("rate_limit") {
        ApiError::RateLimited(message)
    } else if message.to_ascii_lowercase().contains("context")
        || message.to_ascii_lowercase().contains("prompt is too long")
    {
        ApiError::ContextWindowExceeded(message)
    } else {
        ApiError::Transport(message)
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        message: WireMessageStart,
    },
    ContentBlockStart {
        #[allow(dead_code)]
        index: usize,
    },
    ContentBlockDelta {
        #[allow(dead_code)]
        index: usize,
        delta: WireDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: usize,
    },
    MessageDelta {
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: WireError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct WireMessageStart {
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireDelta {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
    cost: Option<f64>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: Option<String>,
}
