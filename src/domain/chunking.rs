//! Re-chunking of a complete response into a paced fragment stream, for
//! providers that have no native streaming.

use crate::domain::ports::TextStream;
use crate::error::GenerationError;
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: usize = 10;
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(10);

/// Waits between emitted chunks.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, delay: Duration);
}

pub struct TokioPacer;

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Emits immediately. Used by tests and by callers that want no pacing.
pub struct NoPacing;

#[async_trait]
impl Pacer for NoPacing {
    async fn pause(&self, _delay: Duration) {}
}

#[derive(Clone)]
pub struct FallbackChunker {
    chunk_size: usize,
    delay: Duration,
    pacer: Arc<dyn Pacer>,
}

impl Default for FallbackChunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_DELAY, Arc::new(TokioPacer))
    }
}

impl FallbackChunker {
    pub fn new(chunk_size: usize, delay: Duration, pacer: Arc<dyn Pacer>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            delay,
            pacer,
        }
    }

    pub fn unpaced(chunk_size: usize) -> Self {
        Self::new(chunk_size, Duration::ZERO, Arc::new(NoPacing))
    }

    /// Splits on character boundaries so multi-byte text never gets cut mid-codepoint.
    pub fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(self.chunk_size)
            .map(|c| c.iter().collect())
            .collect()
    }

    /// Awaits `response` once, then yields its pieces with a pause after each.
    pub fn rechunk<'a, F>(&self, response: F) -> TextStream<'a>
    where
        F: Future<Output = Result<String, GenerationError>> + Send + 'a,
    {
        let chunker = self.clone();
        async_stream::stream! {
            match response.await {
                Ok(text) => {
                    for piece in chunker.split(&text) {
                        yield Ok(piece);
                        chunker.pacer.pause(chunker.delay).await;
                    }
                }
                Err(e) => yield Err(e),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingPacer(Mutex<Vec<Duration>>);

    #[async_trait]
    impl Pacer for RecordingPacer {
        async fn pause(&self, delay: Duration) {
            self.0.lock().unwrap().push(delay);
        }
    }

    #[tokio::test]
    async fn test_rechunk_concatenates_to_original() {
        let chunker = FallbackChunker::unpaced(10);
        let text = "The quick brown fox jumps over the lazy dog".to_string();
        let expected = text.clone();

        let chunks: Vec<String> = chunker
            .rechunk(async move { Ok(text) })
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0], "The quick ");
        assert_eq!(chunks.concat(), expected);
    }

    #[tokio::test]
    async fn test_rechunk_pauses_between_chunks() {
        let pacer = Arc::new(RecordingPacer(Mutex::new(Vec::new())));
        let chunker = FallbackChunker::new(4, Duration::from_millis(10), pacer.clone());

        let chunks: Vec<_> = chunker
            .rechunk(async { Ok("abcdefgh".to_string()) })
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(
            *pacer.0.lock().unwrap(),
            vec![Duration::from_millis(10), Duration::from_millis(10)]
        );
    }

    #[tokio::test]
    async fn test_rechunk_surfaces_error() {
        let chunker = FallbackChunker::unpaced(10);
        let items: Vec<_> = chunker
            .rechunk(async { Err(GenerationError::transport("anthropic", "boom")) })
            .collect()
            .await;

        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let chunker = FallbackChunker::unpaced(2);
        assert_eq!(chunker.split("héllo"), vec!["hé", "ll", "o"]);
        assert!(chunker.split("").is_empty());
    }
}
