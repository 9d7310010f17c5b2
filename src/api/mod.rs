pub mod client;
pub mod logging;
#[cfg(test)]
pub mod mock_client;
pub mod sse;

pub use client::AnthropicClient;

use crate::store::ModelHistoryEntry;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

/// One unit of a streamed model response. Tool invocations are not a wire
/// concept here: they arrive embedded in `Text` and are recovered by the
/// streaming parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiChunk {
    Text(String),
    Reasoning(String),
    Usage(UsageChunk),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageChunk {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    /// Provider-computed cost, when the endpoint reports one.
    pub cost: Option<f64>,
}

/// Provider failures, classified so the task loop can pick a retry policy.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("context window exceeded: {0}")]
    ContextWindowExceeded(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("API endpoint returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn is_context_window(&self) -> bool {
        matches!(self, ApiError::ContextWindowExceeded(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ApiError::RateLimited(_))
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ApiChunk, ApiError>> + Send>>;

/// The single consumed contract with the model endpoint.
#[async_trait]
pub trait ModelStreamProvider: Send + Sync {
    async fn create_message(
        &self,
        system_prompt: &str,
        history: &[ModelHistoryEntry],
    ) -> Result<ChunkStream, ApiError>;
}
