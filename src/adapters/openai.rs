use crate::adapters::sse::{self, CompletionBody};
use crate::domain::models::{GenerationRequest, ModelDescriptor};
use crate::domain::ports::{ProviderAdapter, ProviderCapabilities, TextStream};
use crate::error::GenerationError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MODELS_TIMEOUT: Duration = Duration::from_secs(10);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct OpenAIAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAIAdapter {
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

    async fn fetch_models(&self) -> Result<Vec<OpenAIModel>, GenerationError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(MODELS_TIMEOUT)
            .send()
            .await
            .map_err(|e| GenerationError::transport("openai", e))?;
        let response = sse::check_status("openai", response).await?;
        let list: OpenAIModelList = response
            .json()
            .await
            .map_err(|e| GenerationError::malformed("openai", e))?;
        Ok(list.data)
    }

    fn fallback_models() -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor::new("gpt-4", "GPT-4", "openai", "OpenAI GPT-4"),
            ModelDescriptor::new("gpt-3.5-turbo", "GPT-3.5 Turbo", "openai", "OpenAI GPT-3.5 Turbo"),
        ]
    }
}

#[derive(Deserialize)]
struct OpenAIModelList {
    #[serde(default)]
    data: Vec<OpenAIModel>,
}

#[derive(Deserialize)]
struct OpenAIModel {
    id: String,
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn provider_name(&self) -> &'static str {
        "openai"
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
            Ok(models) => {
                let chat_models: Vec<ModelDescriptor> = models
                    .into_iter()
                    .filter(|m| {
                        let id = m.id.to_lowercase();
                        id.contains("gpt") || id.contains("davinci")
                    })
                    .map(|m| ModelDescriptor {
                        description: format!("OpenAI {}", m.id),
                        name: m.id.clone(),
                        provider: "openai".to_string(),
                        id: m.id,
                    })
                    .collect();
                if chat_models.is_empty() {
                    Self::fallback_models()
                } else {
                    chat_models
                }
            }
            Err(e) => {
                warn!(provider = "openai", error = %e, "Model listing failed, using fallback list");
                Self::fallback_models()
            }
        }
    }

    async fn generate(&self, req: GenerationRequest) -> Result<String, GenerationError> {
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&CompletionBody::new(&req, false));
        sse::complete("openai", request).await
    }

    fn generate_stream<'a>(&'a self, req: GenerationRequest) -> TextStream<'a> {
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&CompletionBody::new(&req, true));
        sse::stream_completion("openai", request)
    }
}
