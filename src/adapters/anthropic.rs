use crate::adapters::sse;
use crate::domain::chunking::FallbackChunker;
use crate::domain::envelope::{EnvelopeCall, EnvelopeFunction, ToolCallEnvelope};
use crate::domain::models::{GenerationRequest, ModelDescriptor, ToolDefinition};
use crate::domain::ports::{ProviderAdapter, ProviderCapabilities};
use crate::error::GenerationError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const MODELS_TIMEOUT: Duration = Duration::from_secs(10);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Anthropic Messages API. Streams by re-chunking the blocking answer.
pub struct AnthropicAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
    chunker: FallbackChunker,
}

impl AnthropicAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            client: sse::http_client(GENERATE_TIMEOUT),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: GENERATE_TIMEOUT,
            chunker: FallbackChunker::default(),
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

    pub fn with_chunker(mut self, chunker: FallbackChunker) -> Self {
        self.chunker = chunker;
        self
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    async fn fetch_models(&self) -> Result<Vec<AnthropicModel>, GenerationError> {
        let response = self
            .authed(self.client.get(format!("{}/models", self.base_url)))
            .timeout(MODELS_TIMEOUT)
            .send()
            .await
            .map_err(|e| GenerationError::transport("anthropic", e))?;
        let response = sse::check_status("anthropic", response).await?;
        let list: AnthropicModelList = response
            .json()
            .await
            .map_err(|e| GenerationError::malformed("anthropic", e))?;
        Ok(list.data)
    }

    fn fallback_models() -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor::new(
                "claude-3-5-sonnet-latest",
                "Claude 3.5 Sonnet",
                "anthropic",
                "Anthropic Claude 3.5 Sonnet",
            ),
            ModelDescriptor::new(
                "claude-3-opus-latest",
                "Claude 3 Opus",
                "anthropic",
                "Anthropic Claude 3 Opus",
            ),
        ]
    }
}

// --- Request ---

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(flatten)]
    options: &'a Map<String, Value>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct AnthropicTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

impl<'a> AnthropicTool<'a> {
    fn from_definition(def: &'a ToolDefinition) -> Self {
        Self {
            name: &def.name,
            description: &def.description,
            input_schema: &def.parameters,
        }
    }
}

fn tool_choice_value(choice: &str) -> Value {
    match choice {
        "auto" => json!({ "type": "auto" }),
        "required" => json!({ "type": "any" }),
        "none" => json!({ "type": "none" }),
        name => json!({ "type": "tool", "name": name }),
    }
}

impl<'a> AnthropicRequest<'a> {
    fn new(req: &'a GenerationRequest) -> Self {
        let tools = req
            .tools
            .as_ref()
            .map(|tools| tools.iter().map(AnthropicTool::from_definition).collect::<Vec<_>>());
        let tool_choice = tools
            .as_ref()
            .and(req.tool_choice.as_deref())
            .map(tool_choice_value);

        Self {
            model: &req.model,
            messages: vec![AnthropicMessage {
                role: "user",
                content: &req.prompt,
            }],
            max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: req.temperature,
            tools,
            tool_choice,
            options: &req.options,
        }
    }
}

// --- Response ---

#[derive(Deserialize)]
struct AnthropicModelList {
    #[serde(default)]
    data: Vec<AnthropicModel>,
}

#[derive(Deserialize)]
struct AnthropicModel {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

/// `text` and `tool_use` blocks are read; other block types are skipped.
#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Value,
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_name(&self) -> &'static str {
        "anthropic"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            tools: true,
            streaming_tools: false,
        }
    }

    async fn validate_key(&self) -> bool {
        self.fetch_models().await.is_ok()
    }

    async fn list_models(&self) -> Vec<ModelDescriptor> {
        match self.fetch_models().await {
            Ok(models) if !models.is_empty() => models
                .into_iter()
                .map(|m| {
                    let name = m.display_name.unwrap_or_else(|| m.id.clone());
                    ModelDescriptor {
                        description: format!("Anthropic {}", name),
                        name,
                        provider: "anthropic".to_string(),
                        id: m.id,
                    }
                })
                .collect(),
            Ok(_) => Self::fallback_models(),
            Err(e) => {
                warn!(provider = "anthropic", error = %e, "Model listing failed, using fallback list");
                Self::fallback_models()
            }
        }
    }

    async fn generate(&self, req: GenerationRequest) -> Result<String, GenerationError> {
        let response = self
            .authed(self.client.post(format!("{}/messages", self.base_url)))
            .timeout(self.timeout)
            .json(&AnthropicRequest::new(&req))
            .send()
            .await
            .map_err(|e| GenerationError::transport("anthropic", e))?;
        let response = sse::check_status("anthropic", response).await?;
        let body: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::malformed("anthropic", e))?;

        let mut text = String::new();
        let mut calls = Vec::new();
        for block in body.content {
            match block.kind.as_str() {
                "text" => text.push_str(block.text.as_deref().unwrap_or_default()),
                "tool_use" => calls.push(EnvelopeCall {
                    id: block.id.unwrap_or_default(),
                    call_type: "function".to_string(),
                    function: EnvelopeFunction {
                        name: block.name.unwrap_or_default(),
                        arguments: Value::String(block.input.to_string()),
                    },
                }),
                _ => {}
            }
        }

        if calls.is_empty() {
            Ok(text)
        } else {
            Ok(ToolCallEnvelope { tool_calls: calls }.to_json())
        }
    }

    fn chunker(&self) -> FallbackChunker {
        self.chunker.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::try_parse_tool_envelope;
    use futures::StreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> AnthropicAdapter {
        AnthropicAdapter::new("ant-key".to_string())
            .with_base_url(server.uri())
            .with_chunker(FallbackChunker::unpaced(10))
    }

    async fn answer_with(server: &MockServer, body: Value) {
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "ant-key"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[test]
    fn test_request_maps_tools_to_input_schema() {
        let req = GenerationRequest::new("hi", "claude")
            .with_tools(Some(vec![ToolDefinition {
                name: "search_internet".to_string(),
                description: "search".to_string(),
                parameters: json!({ "type": "object" }),
            }]))
            .with_tool_choice(Some("required".to_string()));

        let body = serde_json::to_value(AnthropicRequest::new(&req)).unwrap();

        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["tools"][0]["input_schema"], json!({ "type": "object" }));
        assert_eq!(body["tool_choice"], json!({ "type": "any" }));
    }

    #[tokio::test]
    async fn test_generate_tool_use_becomes_envelope() {
        let server = MockServer::start().await;
        answer_with(
            &server,
            json!({
                "content": [
                    { "type": "text", "text": "Let me look that up." },
                    { "type": "tool_use", "id": "toolu_1", "name": "search_internet", "input": { "query": "rust" } }
                ]
            }),
        )
        .await;

        let text = adapter(&server)
            .generate(GenerationRequest::new("hi", "claude"))
            .await
            .unwrap();

        let calls = try_parse_tool_envelope(&text).unwrap().into_tool_calls();
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(calls[0].arguments, json!({ "query": "rust" }));
    }

    #[tokio::test]
    async fn test_stream_rechunks_blocking_answer() {
        let server = MockServer::start().await;
        answer_with(
            &server,
            json!({ "content": [{ "type": "text", "text": "The quick brown fox jumps" }] }),
        )
        .await;

        let adapter = adapter(&server);
        let blocking = adapter
            .generate(GenerationRequest::new("hi", "claude"))
            .await
            .unwrap();
        let chunks: Vec<String> = adapter
            .generate_stream(GenerationRequest::new("hi", "claude"))
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "The quick ");
        assert_eq!(chunks.concat(), blocking);
    }

    #[tokio::test]
    async fn test_list_models_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        assert!(!adapter.validate_key().await);
        assert_eq!(adapter.list_models().await, AnthropicAdapter::fallback_models());
    }
}
