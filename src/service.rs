//! The operations a route layer or CLI calls: key validation, model listing,
//! blocking and streaming chat, and session management.

use crate::adapters::search::SearchService;
use crate::adapters::{build_adapter, tools, Provider};
use crate::config::Config;
use crate::domain::controller::GenerationController;
use crate::domain::models::{
    ConversationTurn, GenerationRequest, ModelDescriptor, Role, SessionSummary, StreamEvent,
};
use crate::domain::orchestrator::ToolOrchestrator;
use crate::domain::ports::{ConversationStore, ProviderAdapter, Tool};
use crate::error::{GatewayError, Result};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const DEFAULT_SESSION_NAME: &str = "New Session";
pub const DEFAULT_SESSION_LIMIT: usize = 50;

/// Builds an adapter for a provider identifier and API key.
pub type AdapterFactory =
    Arc<dyn Fn(&str, &str) -> Result<Box<dyn ProviderAdapter>> + Send + Sync>;

/// Builds the tool catalog for one request, given its search API key.
pub type CatalogFactory = Arc<dyn Fn(Option<&str>) -> Vec<Arc<dyn Tool>> + Send + Sync>;

fn default_temperature() -> f32 {
    0.7
}

fn default_enable_search() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<i64>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_enable_search")]
    pub enable_search: bool,
    #[serde(default)]
    pub search_api_key: Option<String>,
}

impl ChatRequest {
    pub fn new(
        provider: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            api_key: api_key.into(),
            model: model.into(),
            prompt: prompt.into(),
            session_id: None,
            temperature: default_temperature(),
            max_tokens: None,
            enable_search: default_enable_search(),
            search_api_key: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(GatewayError::Validation("prompt must not be empty".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(GatewayError::Validation("model must not be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(GatewayError::Validation(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }
        Ok(())
    }

    fn generation_request(&self) -> GenerationRequest {
        GenerationRequest::new(self.prompt.clone(), self.model.clone())
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatReply {
    pub response: String,
    pub model_used: String,
    pub session_id: Option<i64>,
}

pub struct ChatService {
    store: Arc<dyn ConversationStore>,
    adapters: AdapterFactory,
    catalog: CatalogFactory,
}

impl ChatService {
    /// Real providers and search backends, configured from `config`.
    pub fn new(store: Arc<dyn ConversationStore>, config: &Config) -> Self {
        let adapter_config = config.clone();
        let adapters: AdapterFactory = Arc::new(move |provider: &str, api_key: &str| -> Result<Box<dyn ProviderAdapter>> {
            let provider: Provider = provider.parse()?;
            Ok(build_adapter(
                provider,
                api_key,
                &adapter_config.provider(provider.as_str()),
                &adapter_config.streaming,
            ))
        });

        let search = config.search.clone();
        let catalog: CatalogFactory = Arc::new(move |request_key: Option<&str>| {
            let key = request_key.or(search.api_key.as_deref());
            tools::default_catalog(
                SearchService::from_key(key, search.timeout()),
                search.max_results(),
            )
        });

        Self {
            store,
            adapters,
            catalog,
        }
    }

    pub fn with_adapter_factory(mut self, adapters: AdapterFactory) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_catalog_factory(mut self, catalog: CatalogFactory) -> Self {
        self.catalog = catalog;
        self
    }

    fn controller(&self, search_api_key: Option<&str>) -> GenerationController {
        GenerationController::new(Arc::new(ToolOrchestrator::new((self.catalog)(search_api_key))))
    }

    /// `false` for unknown providers and for any failure.
    pub async fn validate_key(&self, provider: &str, api_key: &str) -> bool {
        match (self.adapters)(provider, api_key) {
            Ok(adapter) => adapter.validate_key().await,
            Err(e) => {
                warn!(provider, error = %e, "Cannot validate key");
                false
            }
        }
    }

    /// Empty for unknown providers; otherwise never empty.
    pub async fn list_models(&self, provider: &str, api_key: &str) -> Vec<ModelDescriptor> {
        match (self.adapters)(provider, api_key) {
            Ok(adapter) => adapter.list_models().await,
            Err(e) => {
                warn!(provider, error = %e, "Cannot list models");
                Vec::new()
            }
        }
    }

    fn require_session(&self, id: i64) -> Result<SessionSummary> {
        self.store
            .get_conversation(id)?
            .ok_or_else(|| GatewayError::NotFound("Session".to_string()))
    }

    /// Blocking chat. The prompt is saved before generation and the answer after.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatReply> {
        request.validate()?;
        let adapter = (self.adapters)(&request.provider, &request.api_key)?;

        if let Some(id) = request.session_id {
            self.require_session(id)?;
            self.store.append_turn(id, Role::User, &request.prompt, None)?;
        }

        let controller = self.controller(request.search_api_key.as_deref());
        let response = controller
            .generate(
                adapter.as_ref(),
                request.generation_request(),
                request.enable_search,
            )
            .await
            .map_err(|e| {
                error!(provider = %request.provider, model = %request.model, error = %e, "Generation failed");
                GatewayError::from(e)
            })?;

        if let Some(id) = request.session_id {
            self.store
                .append_turn(id, Role::Assistant, &response, Some(&request.model))?;
        }

        info!(provider = %request.provider, model = %request.model, chars = response.len(), "Chat complete");
        Ok(ChatReply {
            response,
            model_used: request.model,
            session_id: request.session_id,
        })
    }

    /// Streaming chat. Every failure, including setup failures, arrives as a
    /// single terminal `error` event; the answer is saved only on `done`.
    pub fn chat_stream(&self, request: ChatRequest) -> BoxStream<'static, StreamEvent> {
        let store = self.store.clone();
        let adapters = self.adapters.clone();
        let controller = self.controller(request.search_api_key.as_deref());

        async_stream::stream! {
            if let Err(e) = request.validate() {
                yield StreamEvent::Error(e.to_string());
                return;
            }

            let adapter = match adapters(&request.provider, &request.api_key) {
                Ok(adapter) => adapter,
                Err(e) => {
                    yield StreamEvent::Error(e.to_string());
                    return;
                }
            };

            if let Some(id) = request.session_id {
                match store.get_conversation(id) {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        yield StreamEvent::Error("Session not found".to_string());
                        return;
                    }
                    Err(e) => {
                        yield StreamEvent::Error(e.to_string());
                        return;
                    }
                }
                if let Err(e) = store.append_turn(id, Role::User, &request.prompt, None) {
                    yield StreamEvent::Error(e.to_string());
                    return;
                }
            }

            let mut events = controller.generate_stream(
                adapter.as_ref(),
                request.generation_request(),
                request.enable_search,
            );

            while let Some(event) = events.next().await {
                if let (StreamEvent::Done(full), Some(id)) = (&event, request.session_id) {
                    if let Err(e) = store.append_turn(id, Role::Assistant, full, Some(&request.model)) {
                        error!(session = id, error = %e, "Failed to save streamed answer");
                        yield StreamEvent::Error(format!("Failed to save response: {}", e));
                        return;
                    }
                }
                yield event;
            }
        }
        .boxed()
    }

    pub fn create_session(&self, name: Option<&str>) -> Result<SessionSummary> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_SESSION_NAME);
        self.store.create_conversation(name)
    }

    pub fn list_sessions(&self, limit: Option<usize>) -> Result<Vec<SessionSummary>> {
        self.store
            .list_conversations(limit.unwrap_or(DEFAULT_SESSION_LIMIT))
    }

    pub fn get_session(&self, id: i64) -> Result<SessionSummary> {
        self.require_session(id)
    }

    pub fn delete_session(&self, id: i64) -> Result<()> {
        if self.store.delete_conversation(id)? {
            Ok(())
        } else {
            Err(GatewayError::NotFound("Session".to_string()))
        }
    }

    pub fn list_messages(&self, id: i64) -> Result<Vec<ConversationTurn>> {
        self.require_session(id)?;
        self.store.list_turns(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn service() -> ChatService {
        let store = Arc::new(Storage::in_memory().unwrap());
        ChatService::new(store, &Config::default())
    }

    #[test]
    fn test_request_defaults_from_json() {
        let req: ChatRequest = serde_json::from_str(
            r#"{ "provider": "openai", "api_key": "k", "model": "gpt-4", "prompt": "hi" }"#,
        )
        .unwrap();
        assert_eq!(req.temperature, 0.7);
        assert!(req.enable_search);
        assert!(req.session_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let service = service();
        assert!(!service.validate_key("cohere", "k").await);
        assert!(service.list_models("cohere", "k").await.is_empty());

        let err = service
            .chat(ChatRequest::new("cohere", "k", "m", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_blank_prompt_is_rejected() {
        let err = service()
            .chat(ChatRequest::new("openai", "k", "gpt-4", "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn test_session_lifecycle() {
        let service = service();
        let session = service.create_session(None).unwrap();
        assert_eq!(session.name, DEFAULT_SESSION_NAME);

        assert_eq!(service.list_sessions(None).unwrap().len(), 1);
        assert!(service.list_messages(session.id).unwrap().is_empty());

        service.delete_session(session.id).unwrap();
        let err = service.get_session(session.id).unwrap_err();
        assert_eq!(err.to_string(), "Session not found");
        assert_eq!(err.status_code(), 404);
        assert!(service.delete_session(session.id).is_err());
    }

    #[tokio::test]
    async fn test_stream_missing_session_is_single_error() {
        let mut req = ChatRequest::new("openai", "k", "gpt-4", "hi");
        req.session_id = Some(99);

        let events: Vec<StreamEvent> = service().chat_stream(req).collect().await;
        assert_eq!(events, vec![StreamEvent::Error("Session not found".to_string())]);
    }

    #[tokio::test]
    async fn test_stream_unknown_provider_saves_nothing() {
        let service = service();
        let session = service.create_session(None).unwrap();
        let mut req = ChatRequest::new("cohere", "k", "m", "hi");
        req.session_id = Some(session.id);

        let events: Vec<StreamEvent> = service.chat_stream(req).collect().await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error(m) if m.contains("cohere")));
        assert!(service.list_messages(session.id).unwrap().is_empty());
    }
}
