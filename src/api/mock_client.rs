use super::{ApiChunk, ApiError, ChunkStream, ModelStreamProvider};
use crate::store::ModelHistoryEntry;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One scripted model turn: either a chunk sequence or a failure raised
/// before the first chunk arrives.
pub enum MockTurn {
    Chunks(Vec<ApiChunk>),
    FirstChunkError(ApiError),
    /// Chunks delivered normally, then the stream dies mid-response.
    ChunksThenError(Vec<ApiChunk>, ApiError),
}

/// Scripted provider for loop tests. Records the history length of every
/// request so truncation behavior can be asserted.
#[derive(Clone)]
pub struct MockProvider {
    turns: Arc<Mutex<VecDeque<MockTurn>>>,
    pub request_history_lens: Arc<Mutex<Vec<usize>>>,
}

impl MockProvider {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns.into_iter().collect())),
            request_history_lens: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: a turn that streams `text` in small pieces and reports
    /// fixed usage, the common case in scenario tests.
    pub fn text_turn(text: &str) -> MockTurn {
        let mut chunks = vec![ApiChunk::Usage(super::UsageChunk {
            tokens_in: 100,
            tokens_out: 0,
            cache_writes: 0,
            cache_reads: 0,
            cost: Some(0.01),
        })];
        for piece in split_into_pieces(text, 7) {
            chunks.push(ApiChunk::Text(piece));
        }
        MockTurn::Chunks(chunks)
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelStreamProvider for MockProvider {
    async fn create_message(
        &self,
        _system_prompt: &str,
        history: &[ModelHistoryEntry],
    ) -> Result<ChunkStream, ApiError> {
        self.request_history_lens
            .lock()
            .unwrap()
            .push(history.len());

        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockTurn::Chunks(Vec::new()));

        match turn {
            MockTurn::FirstChunkError(error) => Err(error),
            MockTurn::Chunks(chunks) => {
                let items: Vec<Result<ApiChunk, ApiError>> =
                    chunks.into_iter().map(Ok).collect();
                Ok(Box::pin(futures::stream::iter(items)))
            }
            MockTurn::ChunksThenError(chunks, error) => {
                let mut items: Vec<Result<ApiChunk, ApiError>> =
                    chunks.into_iter().map(Ok).collect();
                items.push(Err(error));
                Ok(Box::pin(futures::stream::iter(items)))
            }
        }
    }
}

fn split_into_pieces(text: &str, piece_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(piece_chars.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_mock_provider_replays_turns_in_order() {
        let provider = MockProvider::new(vec![
            MockProvider::text_turn("hello"),
            MockTurn::FirstChunkError(ApiError::RateLimited("slow down".to_string())),
        ]);

        let mut stream = provider
            .create_message("sys", &[])
            .await
            .expect("first turn streams");
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let ApiChunk::Text(piece) = chunk.expect("scripted chunk") {
                text.push_str(&piece);
            }
        }
        assert_eq!(text, "hello");

        let second = provider.create_message("sys", &[]).await;
        assert!(matches!(second, Err(ApiError::RateLimited(_))));
        assert_eq!(*provider.request_history_lens.lock().unwrap(), vec![0, 0]);
    }
}
