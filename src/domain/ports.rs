use crate::domain::chunking::FallbackChunker;
use crate::domain::models::*;
use crate::error::{GenerationError, SearchError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

/// Ordered text fragments of one streamed generation. Not rewindable.
pub type TextStream<'a> = BoxStream<'a, Result<String, GenerationError>>;

/// Result of running a tool: model-readable text, or an error message.
pub type ToolOutput = Result<String, String>;

/// What a provider can do beyond plain text generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    /// Accepts tool definitions on blocking `generate`.
    pub tools: bool,
    /// Reports tool calls from `generate_stream` reliably.
    pub streaming_tools: bool,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_name(&self) -> &'static str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Cheap authenticated call. Any failure means `false`.
    async fn validate_key(&self) -> bool;

    /// Never empty: falls back to a static list when the provider can't be reached.
    async fn list_models(&self) -> Vec<ModelDescriptor>;

    /// Plain text, or a serialized tool-call envelope when the model asked for tools.
    async fn generate(&self, req: GenerationRequest) -> Result<String, GenerationError>;

    /// Strategy used by the default `generate_stream`.
    fn chunker(&self) -> FallbackChunker {
        FallbackChunker::default()
    }

    /// Providers without native streaming re-chunk a single `generate` result.
    fn generate_stream<'a>(&'a self, req: GenerationRequest) -> TextStream<'a> {
        self.chunker().rechunk(self.generate(req))
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, input: Value) -> ToolOutput;
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError>;
}

/// Session persistence used around generation.
pub trait ConversationStore: Send + Sync {
    fn create_conversation(&self, name: &str) -> crate::error::Result<SessionSummary>;
    fn get_conversation(&self, id: i64) -> crate::error::Result<Option<SessionSummary>>;
    fn list_conversations(&self, limit: usize) -> crate::error::Result<Vec<SessionSummary>>;
    fn delete_conversation(&self, id: i64) -> crate::error::Result<bool>;
    fn append_turn(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        model_used: Option<&str>,
    ) -> crate::error::Result<ConversationTurn>;
    fn list_turns(&self, conversation_id: i64) -> crate::error::Result<Vec<ConversationTurn>>;
}
