use super::logging::{debug_payload_enabled, emit_debug_payload};
use super::sse::SseParser;
use super::{ApiChunk, ApiError, ChunkStream, ModelStreamProvider};
use crate::config::Config;
use crate::store::ModelHistoryEntry;
use crate::util::is_local_endpoint_url;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;

/// Streaming client for the Anthropic messages endpoint.
#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    api_url: String,
    anthropic_version: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            api_url: config.api_url.clone(),
            anthropic_version: config.anthropic_version.clone(),
            max_tokens: resolve_max_tokens(&config.api_url),
        }
    }
}

#[async_trait]
impl ModelStreamProvider for AnthropicClient {
    async fn create_message(
        &self,
        system_prompt: &str,
        history: &[ModelHistoryEntry],
    ) -> Result<ChunkStream, ApiError> {
        let payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "stream": true,
            "system": system_prompt,
            "messages": history,
        });

        if debug_payload_enabled() {
            emit_debug_payload(&self.api_url, &payload);
        }

        let mut request = self
            .http
            .post(&self.api_url)
            .header("content-type", "application/json")
            .json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.header("x-api-key", api_key);
        }
        if !self.anthropic_version.trim().is_empty() {
            request = request.header("anthropic-version", &self.anthropic_version);
        }

        let response = request
            .send()
            .await
            .map_err(|error| map_request_error(error, &self.api_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), &body));
        }

        let mut parser = SseParser::new();
        let url = self.api_url.clone();
        let stream = response.bytes_stream().flat_map(move |item| {
            let out: Vec<Result<ApiChunk, ApiError>> = match item {
                Ok(bytes) => match parser.process(&bytes) {
                    Ok(chunks) => chunks.into_iter().map(Ok).collect(),
                    Err(error) => vec![Err(error)],
                },
                Err(error) => vec![Err(map_request_error(error, &url))],
            };
            futures::stream::iter(out)
        });

        Ok(Box::pin(stream))
    }
}

fn map_request_error(error: reqwest::Error, request_url: &str) -> ApiError {
    if error.is_connect() && is_local_endpoint_url(request_url) {
        return ApiError::Transport(format!(
            "cannot reach local API endpoint '{request_url}': {error}. Start your local server or update ANTHROPIC_API_URL."
        ));
    }
    if error.is_connect() {
        return ApiError::Transport(format!("cannot reach API endpoint '{request_url}': {error}"));
    }
    if error.is_timeout() {
        return ApiError::Transport(format!("API request to '{request_url}' timed out: {error}"));
    }
    ApiError::Transport(format!("API request to '{request_url}' failed: {error}"))
}

/// HTTP-status classification. Context exhaustion arrives as a 400 whose
/// body names the prompt length; overload and throttling share the retry
/// class.
fn classify_http_error(status: u16, body: &str) -> ApiError {
    let lowered = body.to_ascii_lowercase();
    if status == 400
        && (lowered.contains("prompt is too long")
            || lowered.contains("context window")
            || lowered.contains("context_length"))
    {
        return ApiError::ContextWindowExceeded(body.to_string());
    }
    if status == 429 || status == 529 || lowered.contains("overloaded_error") {
        return ApiError::RateLimited(body.to_string());
    }
    ApiError::Http {
        status,
        message: body.to_string(),
    }
}

fn resolve_max_tokens(api_url: &str) -> u32 {
    if let Some(value) = std::env::var("TILLER_MAX_TOKENS")
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
    {
        return value.clamp(128, 64_000);
    }

    if is_local_endpoint_url(api_url) {
        1024
    } else {
        8192
    }
}
