use crate::adapters::sse::{self, diagnostic_fragment};
use crate::domain::envelope::{EnvelopeCall, EnvelopeFunction, ToolCallEnvelope};
use crate::domain::models::{GenerationRequest, ModelDescriptor};
use crate::domain::ports::{ProviderAdapter, ProviderCapabilities, TextStream};
use crate::error::GenerationError;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const MODELS_TIMEOUT: Duration = Duration::from_secs(10);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Google Gemini over the `generativelanguage` REST API.
///
/// Tool definitions are never sent: function calling is not wired for this
/// provider, in either mode. A function call the model produces anyway is still
/// reported as an envelope.
pub struct GeminiAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl GeminiAdapter {
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

    fn model_call(&self, model: &str, method: &str) -> RequestBuilder {
        let model = model.strip_prefix("models/").unwrap_or(model);
        self.client
            .post(format!("{}/models/{}:{}", self.base_url, model, method))
            .header("x-goog-api-key", &self.api_key)
    }

    async fn fetch_models(&self) -> Result<Vec<GeminiModel>, GenerationError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .timeout(MODELS_TIMEOUT)
            .send()
            .await
            .map_err(|e| GenerationError::transport("gemini", e))?;
        let response = sse::check_status("gemini", response).await?;
        let list: GeminiModelList = response
            .json()
            .await
            .map_err(|e| GenerationError::malformed("gemini", e))?;
        Ok(list.models)
    }

    fn fallback_models() -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor::new("gemini-pro", "Gemini Pro", "gemini", "Google Gemini Pro"),
            ModelDescriptor::new(
                "gemini-pro-vision",
                "Gemini Pro Vision",
                "gemini",
                "Google Gemini Pro Vision",
            ),
        ]
    }
}

// --- Request ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    generation_config: GenerationConfig,
    #[serde(flatten)]
    options: &'a Map<String, Value>,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: Vec<TextPart<'a>>,
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

impl<'a> GeminiRequest<'a> {
    fn new(req: &'a GenerationRequest) -> Self {
        if req.tools.is_some() {
            debug!(provider = "gemini", "Dropping tool definitions");
        }
        Self {
            contents: vec![GeminiContent {
                role: "user",
                parts: vec![TextPart { text: &req.prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: req.temperature,
                max_output_tokens: req.max_tokens,
            },
            options: &req.options,
        }
    }
}

// --- Response ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModelList {
    #[serde(default)]
    models: Vec<GeminiModel>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModel {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

impl GeminiResponse {
    fn parts(self) -> impl Iterator<Item = ResponsePart> {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts)
            .unwrap_or_default()
            .into_iter()
    }

    fn blocked(&self) -> Option<&str> {
        self.prompt_feedback.as_ref()?.block_reason.as_deref()
    }
}

/// Text of all parts, or an envelope when any part is a function call.
fn render_parts(parts: impl Iterator<Item = ResponsePart>) -> String {
    let mut text = String::new();
    let mut calls = Vec::new();
    for part in parts {
        if let Some(call) = part.function_call {
            calls.push(EnvelopeCall {
                id: format!("gemini_call_{}", Uuid::new_v4()),
                call_type: "function".to_string(),
                function: EnvelopeFunction {
                    name: call.name,
                    arguments: Value::String(call.args.to_string()),
                },
            });
        } else if let Some(t) = part.text {
            text.push_str(&t);
        }
    }
    if calls.is_empty() {
        text
    } else {
        ToolCallEnvelope { tool_calls: calls }.to_json()
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider_name(&self) -> &'static str {
        "gemini"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            tools: false,
            streaming_tools: false,
        }
    }

    async fn validate_key(&self) -> bool {
        self.fetch_models().await.is_ok()
    }

    async fn list_models(&self) -> Vec<ModelDescriptor> {
        match self.fetch_models().await {
            Ok(models) => {
                let usable: Vec<ModelDescriptor> = models
                    .into_iter()
                    .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
                    .map(|m| {
                        let id = m.name.rsplit('/').next().unwrap_or(&m.name).to_string();
                        let display = m.display_name.unwrap_or_else(|| id.clone());
                        ModelDescriptor {
                            description: format!("Google {}", display),
                            name: display,
                            provider: "gemini".to_string(),
                            id,
                        }
                    })
                    .collect();
                if usable.is_empty() {
                    Self::fallback_models()
                } else {
                    usable
                }
            }
            Err(e) => {
                warn!(provider = "gemini", error = %e, "Model listing failed, using fallback list");
                Self::fallback_models()
            }
        }
    }

    async fn generate(&self, req: GenerationRequest) -> Result<String, GenerationError> {
        let response = self
            .model_call(&req.model, "generateContent")
            .timeout(self.timeout)
            .json(&GeminiRequest::new(&req))
            .send()
            .await
            .map_err(|e| GenerationError::transport("gemini", e))?;
        let response = sse::check_status("gemini", response).await?;
        let body: GeminiResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::malformed("gemini", e))?;

        if body.candidates.is_empty() {
            let reason = body.blocked().unwrap_or("no candidates returned");
            return Err(GenerationError::malformed("gemini", reason));
        }
        Ok(render_parts(body.parts()))
    }

    fn generate_stream<'a>(&'a self, req: GenerationRequest) -> TextStream<'a> {
        let request = self
            .model_call(&req.model, "streamGenerateContent?alt=sse")
            .json(&GeminiRequest::new(&req));

        async_stream::stream! {
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(GenerationError::transport("gemini", e));
                    return;
                }
            };
            let response = match sse::check_status("gemini", response).await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let failure = match event {
                    Ok(event) => match serde_json::from_str::<GeminiResponse>(&event.data) {
                        Ok(chunk) => match chunk.blocked() {
                            Some(reason) => Some(format!("response blocked: {}", reason)),
                            None => {
                                let text = render_parts(chunk.parts());
                                if !text.is_empty() {
                                    yield Ok(text);
                                }
                                None
                            }
                        },
                        Err(e) => Some(format!("undecodable frame: {}", e)),
                    },
                    Err(e) => Some(e.to_string()),
                };

                if let Some(message) = failure {
                    let err = GenerationError::stream("gemini", message);
                    yield Ok(diagnostic_fragment(&err));
                    yield Err(err);
                    return;
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::try_parse_tool_envelope;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> GeminiAdapter {
        GeminiAdapter::new("g-key".to_string()).with_base_url(server.uri())
    }

    #[tokio::test]
    async fn test_list_models_keeps_generate_content_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .and(header("x-goog-api-key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [
                    {
                        "name": "models/gemini-1.5-pro",
                        "displayName": "Gemini 1.5 Pro",
                        "supportedGenerationMethods": ["generateContent", "countTokens"]
                    },
                    {
                        "name": "models/embedding-001",
                        "displayName": "Embedding 001",
                        "supportedGenerationMethods": ["embedContent"]
                    }
                ]
            })))
            .mount(&server)
            .await;

        let models = adapter(&server).list_models().await;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "gemini-1.5-pro");
        assert_eq!(models[0].description, "Google Gemini 1.5 Pro");
    }

    #[tokio::test]
    async fn test_invalid_key_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        assert!(!adapter.validate_key().await);
        assert_eq!(adapter.list_models().await, GeminiAdapter::fallback_models());
    }

    #[tokio::test]
    async fn test_generate_joins_text_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .and(body_partial_json(json!({
                "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }],
                "generationConfig": { "maxOutputTokens": 64 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": "Hello " }, { "text": "world" }] } }]
            })))
            .mount(&server)
            .await;

        let req = GenerationRequest::new("hi", "models/gemini-pro").with_max_tokens(Some(64));
        assert_eq!(adapter(&server).generate(req).await.unwrap(), "Hello world");
    }

    #[tokio::test]
    async fn test_generate_function_call_becomes_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [
                    { "functionCall": { "name": "search_internet", "args": { "query": "rust" } } }
                ] } }]
            })))
            .mount(&server)
            .await;

        let text = adapter(&server)
            .generate(GenerationRequest::new("hi", "gemini-pro"))
            .await
            .unwrap();

        let calls = try_parse_tool_envelope(&text).unwrap().into_tool_calls();
        assert!(calls[0].id.starts_with("gemini_call_"));
        assert_eq!(calls[0].arguments, json!({ "query": "rust" }));
    }

    #[tokio::test]
    async fn test_blocked_prompt_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "promptFeedback": { "blockReason": "SAFETY" }
            })))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .generate(GenerationRequest::new("hi", "gemini-pro"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[tokio::test]
    async fn test_stream_yields_frames_then_fails_with_diagnostic() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(
                        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n\
                         data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}]}\n\n\
                         data: not json\n\n",
                    ),
            )
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let items: Vec<_> = adapter
            .generate_stream(GenerationRequest::new("hi", "gemini-pro"))
            .collect()
            .await;

        assert_eq!(items.len(), 4);
        assert_eq!(items[0].as_ref().unwrap(), "Hel");
        assert_eq!(items[1].as_ref().unwrap(), "lo");
        assert!(items[2]
            .as_ref()
            .unwrap()
            .starts_with("\n\n[Error: gemini streaming error:"));
        assert!(items[3].is_err());
    }

    #[tokio::test]
    async fn test_stream_respects_configured_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:streamGenerateContent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("")
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let adapter = adapter(&server).with_timeout(Duration::from_millis(200));
        let started = tokio::time::Instant::now();
        let items: Vec<_> = adapter
            .generate_stream(GenerationRequest::new("hi", "gemini-pro"))
            .collect()
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(items.last(), Some(Err(_))));
    }
}
