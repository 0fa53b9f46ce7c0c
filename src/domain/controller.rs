//! The bounded generate → tool → re-generate loop.
//!
//! One run per user request. Tools are offered on the first iteration only, so
//! later iterations push the model toward a final answer built from the results
//! already gathered. The loop never runs more than [`MAX_ITERATIONS`] provider
//! calls, whatever the model keeps asking for.

use crate::domain::envelope::try_parse_tool_envelope;
use crate::domain::models::{GenerationRequest, Message, Role, StreamEvent, ToolCall, ToolResult};
use crate::domain::orchestrator::{ToolOrchestrator, SEARCH_TOOL};
use crate::domain::ports::ProviderAdapter;
use crate::error::GenerationError;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MAX_ITERATIONS: usize = 5;

pub struct GenerationController {
    orchestrator: Arc<ToolOrchestrator>,
}

/// Conversation state carried between iterations of one run.
struct Transcript {
    prompt: String,
    messages: Vec<Message>,
}

impl Transcript {
    fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            messages: vec![Message::user(prompt)],
        }
    }

    fn record(&mut self, results: &[ToolResult]) {
        self.messages.extend(results.iter().map(Message::tool_output));
    }

    /// Prompt for the next iteration: the user turn and tool outputs so far,
    /// followed by an instruction to answer from them.
    fn follow_up_prompt(&self) -> String {
        let instruction = format!(
            "Based on the search results, please provide a comprehensive answer to: {}",
            self.prompt
        );
        let mut parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| m.content.as_str())
            .collect();
        parts.push(&instruction);
        parts.join("\n")
    }
}

impl GenerationController {
    pub fn new(orchestrator: Arc<ToolOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &ToolOrchestrator {
        &self.orchestrator
    }

    fn request_for(
        &self,
        base: &GenerationRequest,
        transcript: &Transcript,
        iteration: usize,
        offer_tools: bool,
    ) -> GenerationRequest {
        let mut req = base.clone();
        if iteration == 1 {
            req.prompt = transcript.prompt.clone();
            req.tools = offer_tools.then(|| self.orchestrator.get_tools());
        } else {
            req.prompt = transcript.follow_up_prompt();
            req.tools = None;
            req.tool_choice = None;
        }
        req
    }

    /// Runs the loop to a final answer.
    ///
    /// Provider failures propagate. Hitting the cap returns the last raw
    /// response, even when that response is still a tool-call envelope.
    pub async fn generate(
        &self,
        adapter: &dyn ProviderAdapter,
        base: GenerationRequest,
        enable_search: bool,
    ) -> Result<String, GenerationError> {
        let provider = adapter.provider_name();
        let offer_tools = enable_search && adapter.capabilities().tools;
        let mut transcript = Transcript::new(&base.prompt);
        let mut response = String::new();

        for iteration in 1..=MAX_ITERATIONS {
            let req = self.request_for(&base, &transcript, iteration, offer_tools);
            debug!(provider, model = %req.model, iteration, tools = req.tools.is_some(), "Generating");
            response = adapter.generate(req).await?;

            let Some(envelope) = try_parse_tool_envelope(&response) else {
                info!(provider, iteration, "Generation finished");
                return Ok(response);
            };

            let calls = envelope.into_tool_calls();
            debug!(provider, iteration, calls = calls.len(), "Model requested tools");
            let results = self.orchestrator.process_tool_calls(&calls).await;
            transcript.record(&results);
        }

        warn!(provider, max = MAX_ITERATIONS, "Iteration cap reached, returning last response");
        Ok(response)
    }

    /// Streaming form of [`generate`](Self::generate).
    ///
    /// Text fragments are forwarded as `chunk` events as they arrive. A stream
    /// ends with exactly one `done` (carrying every forwarded chunk, concatenated)
    /// or one `error`.
    pub fn generate_stream<'a>(
        &'a self,
        adapter: &'a dyn ProviderAdapter,
        base: GenerationRequest,
        enable_search: bool,
    ) -> BoxStream<'a, StreamEvent> {
        async_stream::stream! {
            let provider = adapter.provider_name();
            let offer_tools = enable_search && adapter.capabilities().streaming_tools;
            let mut transcript = Transcript::new(&base.prompt);
            let mut full_response = String::new();

            for iteration in 1..=MAX_ITERATIONS {
                let req = self.request_for(&base, &transcript, iteration, offer_tools);
                debug!(provider, model = %req.model, iteration, tools = req.tools.is_some(), "Streaming");

                let mut fragments = adapter.generate_stream(req);
                let mut requested: Option<Vec<ToolCall>> = None;

                while let Some(item) = fragments.next().await {
                    match item {
                        Ok(fragment) => {
                            if let Some(envelope) = try_parse_tool_envelope(&fragment) {
                                requested = Some(envelope.into_tool_calls());
                                continue;
                            }
                            full_response.push_str(&fragment);
                            yield StreamEvent::Chunk(fragment);
                        }
                        Err(e) => {
                            warn!(provider, iteration, error = %e, "Stream failed");
                            yield StreamEvent::Error(e.to_string());
                            return;
                        }
                    }
                }

                let Some(calls) = requested else {
                    info!(provider, iteration, chars = full_response.len(), "Stream finished");
                    yield StreamEvent::Done(full_response);
                    return;
                };

                for call in &calls {
                    yield StreamEvent::ToolCall(self.orchestrator.describe_call(call));
                }
                let results = self.orchestrator.process_tool_calls(&calls).await;
                for result in results.iter().filter(|r| r.name == SEARCH_TOOL) {
                    yield StreamEvent::SearchResults(result.content.clone());
                }
                transcript.record(&results);
            }

            warn!(provider, max = MAX_ITERATIONS, "Iteration cap reached while streaming");
            yield StreamEvent::Done(full_response);
        }
        .boxed()
    }
}
