//! Wire handling shared by the OpenAI-compatible chat-completions providers
//! (OpenAI and OpenRouter), plus the failure tail every native stream ends with.

use crate::domain::envelope::{EnvelopeCall, EnvelopeFunction, ToolCallEnvelope};
use crate::domain::models::GenerationRequest;
use crate::domain::ports::TextStream;
use crate::error::GenerationError;
use eventsource_stream::Eventsource;
use futures::stream::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for provider calls. Streams have no total deadline, so every read
/// is bounded by `read_timeout` instead.
pub fn http_client(read_timeout: Duration) -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(read_timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Last content fragment of a stream that failed midway.
pub fn diagnostic_fragment(err: &GenerationError) -> String {
    format!("\n\n[Error: {}]", err)
}

/// Turns a non-2xx response into `GenerationError::Api`.
pub async fn check_status(provider: &str, response: Response) -> Result<Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GenerationError::Api {
        provider: provider.to_string(),
        status: status.as_u16(),
        body,
    })
}

// --- Request ---

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
pub struct CompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(flatten)]
    options: &'a Map<String, Value>,
}

impl<'a> CompletionBody<'a> {
    pub fn new(req: &'a GenerationRequest, stream: bool) -> Self {
        let tools = req
            .tools
            .as_ref()
            .map(|tools| tools.iter().map(|t| t.to_function_json()).collect::<Vec<_>>());
        // A choice hint without tools is rejected by the API.
        let tool_choice = tools
            .as_ref()
            .and(req.tool_choice.as_deref())
            .map(tool_choice_value);

        Self {
            model: &req.model,
            messages: vec![WireMessage {
                role: "user",
                content: &req.prompt,
            }],
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            tools,
            tool_choice,
            stream,
            options: &req.options,
        }
    }
}

fn tool_choice_value(choice: &str) -> Value {
    match choice {
        "auto" | "none" | "required" => Value::String(choice.to_string()),
        name => json!({ "type": "function", "function": { "name": name } }),
    }
}

// --- Blocking response ---

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn envelope_call(id: String, name: String, arguments: String) -> EnvelopeCall {
    EnvelopeCall {
        id,
        call_type: "function".to_string(),
        function: EnvelopeFunction {
            name,
            arguments: Value::String(arguments),
        },
    }
}

/// Sends a blocking completion and returns its text, or the tool-call envelope
/// when the model chose to call tools.
pub async fn complete(provider: &str, request: RequestBuilder) -> Result<String, GenerationError> {
    let response = request
        .send()
        .await
        .map_err(|e| GenerationError::transport(provider, e))?;
    let response = check_status(provider, response).await?;

    let body = response
        .text()
        .await
        .map_err(|e| GenerationError::transport(provider, e))?;
    let parsed: CompletionResponse =
        serde_json::from_str(&body).map_err(|e| GenerationError::malformed(provider, e))?;

    let message = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| GenerationError::malformed(provider, "no choices in response"))?;

    match message.tool_calls {
        Some(calls) if !calls.is_empty() => {
            let envelope = ToolCallEnvelope {
                tool_calls: calls
                    .into_iter()
                    .map(|c| envelope_call(c.id, c.function.name, c.function.arguments))
                    .collect(),
            };
            Ok(envelope.to_json())
        }
        _ => Ok(message.content.unwrap_or_default()),
    }
}

// --- Streaming response ---

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamFault>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct StreamFault {
    #[serde(default)]
    message: String,
}

#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Streams a completion as text fragments.
///
/// Tool-call deltas are accumulated by index and, once the provider finishes,
/// emitted as a single envelope fragment. A failure after the response started
/// yields a diagnostic fragment followed by the error.
pub fn stream_completion(provider: &'static str, request: RequestBuilder) -> TextStream<'static> {
    async_stream::stream! {
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                yield Err(GenerationError::transport(provider, e));
                return;
            }
        };
        let response = match check_status(provider, response).await {
            Ok(r) => r,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        let mut events = response.bytes_stream().eventsource();
        let mut pending: BTreeMap<u32, PendingCall> = BTreeMap::new();
        let mut fragments = 0usize;

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    let err = GenerationError::stream(provider, e);
                    yield Ok(diagnostic_fragment(&err));
                    yield Err(err);
                    return;
                }
            };

            let data = event.data.trim();
            if data == "[DONE]" {
                break;
            }
            if data.is_empty() {
                continue;
            }

            let chunk: StreamChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(provider, error = %e, "Skipping undecodable stream frame");
                    continue;
                }
            };

            if let Some(fault) = chunk.error {
                let err = GenerationError::stream(provider, fault.message);
                yield Ok(diagnostic_fragment(&err));
                yield Err(err);
                return;
            }

            for choice in chunk.choices {
                if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                    fragments += 1;
                    yield Ok(content);
                }
                for delta in choice.delta.tool_calls.unwrap_or_default() {
                    let entry = pending.entry(delta.index).or_default();
                    if let Some(id) = delta.id {
                        entry.id = id;
                    }
                    if let Some(function) = delta.function {
                        if let Some(name) = function.name {
                            entry.name.push_str(&name);
                        }
                        if let Some(arguments) = function.arguments {
                            entry.arguments.push_str(&arguments);
                        }
                    }
                }
            }
        }

        if !pending.is_empty() {
            let envelope = ToolCallEnvelope {
                tool_calls: pending
                    .into_values()
                    .map(|c| envelope_call(c.id, c.name, c.arguments))
                    .collect(),
            };
            yield Ok(envelope.to_json());
        } else if fragments == 0 {
            warn!(provider, "Stream finished without any content");
        }
    }
    .boxed()
}
