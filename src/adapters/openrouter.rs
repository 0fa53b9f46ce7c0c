use crate::adapters::sse::{self, CompletionBody};
use crate::domain::models::{GenerationRequest, ModelDescriptor};
use crate::domain::ports::{ProviderAdapter, ProviderCapabilities, TextStream};
use crate::error::GenerationError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const MODELS_TIMEOUT: Duration = Duration::from_secs(10);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);
const APP_TITLE: &str = "Research Assistant";

/// OpenRouter speaks the OpenAI chat-completions dialect for every model it routes to.
pub struct OpenRouterAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl OpenRouterAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            client: sse::http_client(GENERATE_TIMEOUT),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: GENERATE_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Bounds a blocking call end to end and each read of a stream.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = sse::http_client(timeout);
        self.timeout = timeout;
        self
    }

    fn completions(&self, req: &GenerationRequest, stream: bool) -> RequestBuilder {
        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Title", APP_TITLE)
            .json(&CompletionBody::new(req, stream))
    }

    async fn fetch_models(&self) -> Result<Vec<RoutedModel>, GenerationError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(MODELS_TIMEOUT)
            .send()
            .await
            .map_err(|e| GenerationError::transport("openrouter", e))?;
        let response = sse::check_status("openrouter", response).await?;
        let list: RoutedModelList = response
            .json()
            .await
            .map_err(|e| GenerationError::malformed("openrouter", e))?;
        Ok(list.data)
    }

    fn fallback_models() -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor::new(
                "openai/gpt-4",
                "GPT-4 (via OpenRouter)",
                "openrouter",
                "OpenAI GPT-4 via OpenRouter",
            ),
            ModelDescriptor::new(
                "anthropic/claude-3-opus",
                "Claude 3 Opus (via OpenRouter)",
                "openrouter",
                "Anthropic Claude 3 Opus via OpenRouter",
            ),
        ]
    }
}

#[derive(Deserialize)]
struct RoutedModelList {
    #[serde(default)]
    data: Vec<RoutedModel>,
}

#[derive(Deserialize)]
struct RoutedModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait]
impl ProviderAdapter for OpenRouterAdapter {
    fn provider_name(&self) -> &'static str {
        "openrouter"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            tools: true,
            streaming_tools: true,
        }
    }

    async fn validate_key(&self) -> bool {
        self.fetch_models().await.is_ok()
    }

    async fn list_models(&self) -> Vec<ModelDescriptor> {
        match self.fetch_models().await {
            Ok(models) if !models.is_empty() => models
                .into_iter()
                .map(|m| ModelDescriptor {
                    name: m.name.unwrap_or_else(|| m.id.clone()),
                    description: m
                        .description
                        .unwrap_or_else(|| format!("OpenRouter {}", m.id)),
                    provider: "openrouter".to_string(),
                    id: m.id,
                })
                .collect(),
            Ok(_) => Self::fallback_models(),
            Err(e) => {
                warn!(provider = "openrouter", error = %e, "Model listing failed, using fallback list");
                Self::fallback_models()
            }
        }
    }

    async fn generate(&self, req: GenerationRequest) -> Result<String, GenerationError> {
        let request = self.completions(&req, false).timeout(self.timeout);
        sse::complete("openrouter", request).await
    }

    fn generate_stream<'a>(&'a self, req: GenerationRequest) -> TextStream<'a> {
        sse::stream_completion("openrouter", self.completions(&req, true))
    }
}
