//! End-to-end runs of the chat service against scripted providers, a fake
//! search backend and in-memory SQLite.

use async_trait::async_trait;
use futures::StreamExt;
use research_assistant::adapters::search::SearchService;
use research_assistant::adapters::tools::SearchInternetTool;
use research_assistant::domain::envelope::ToolCallEnvelope;
use research_assistant::domain::models::{
    GenerationRequest, ModelDescriptor, Role, SearchResult, ToolCall,
};
use research_assistant::domain::ports::{
    ProviderAdapter, ProviderCapabilities, SearchBackend, TextStream, Tool,
};
use research_assistant::error::SearchError;
use research_assistant::{
    ChatRequest, ChatService, Config, GatewayError, GenerationError, Storage, StreamEvent,
    MAX_ITERATIONS,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct Script {
    responses: Mutex<VecDeque<Result<String, GenerationError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl Script {
    fn new(responses: Vec<Result<String, GenerationError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Answers from a shared script; the last entry repeats.
struct ScriptedProvider(Arc<Script>);

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
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
        true
    }

    async fn list_models(&self) -> Vec<ModelDescriptor> {
        vec![ModelDescriptor::new("gpt-4", "gpt-4", "openai", "OpenAI gpt-4")]
    }

    async fn generate(&self, req: GenerationRequest) -> Result<String, GenerationError> {
        self.0.requests.lock().unwrap().push(req);
        let mut responses = self.0.responses.lock().unwrap();
        if responses.len() > 1 {
            responses.pop_front().unwrap_or_else(|| Ok(String::new()))
        } else {
            responses.front().cloned().unwrap_or_else(|| Ok(String::new()))
        }
    }

    /// Envelopes arrive whole, text arrives word by word.
    fn generate_stream<'a>(&'a self, req: GenerationRequest) -> TextStream<'a> {
        async_stream::stream! {
            match self.generate(req).await {
                Ok(text) if text.contains("\"tool_calls\"") => yield Ok(text),
                Ok(text) => {
                    for word in text.split_inclusive(' ') {
                        yield Ok(word.to_string());
                    }
                }
                Err(e) => yield Err(e),
            }
        }
        .boxed()
    }
}

struct FakeSearch(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl SearchBackend for FakeSearch {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn search(&self, query: &str, _max: usize) -> Result<Vec<SearchResult>, SearchError> {
        self.0.lock().unwrap().push(query.to_string());
        Ok(vec![SearchResult {
            title: "Rust 2024 edition".to_string(),
            url: "https://blog.rust-lang.org".to_string(),
            snippet: "The 2024 edition is stable.".to_string(),
            source: "fake".to_string(),
        }])
    }
}

fn search_call(query: &str) -> String {
    ToolCallEnvelope::from_calls(&[ToolCall {
        id: "call_1".to_string(),
        name: "search_internet".to_string(),
        arguments: json!({ "query": query }),
    }])
    .to_json()
}

struct Harness {
    service: ChatService,
    script: Arc<Script>,
    queries: Arc<Mutex<Vec<String>>>,
}

fn harness(responses: Vec<Result<String, GenerationError>>) -> Harness {
    let script = Script::new(responses);
    let queries = Arc::new(Mutex::new(Vec::new()));

    let adapter_script = script.clone();
    let catalog_queries = queries.clone();
    let service = ChatService::new(Arc::new(Storage::in_memory().unwrap()), &Config::default())
        .with_adapter_factory(Arc::new(
            move |_: &str, _: &str| -> research_assistant::error::Result<Box<dyn ProviderAdapter>> {
                Ok(Box::new(ScriptedProvider(adapter_script.clone())))
            },
        ))
        .with_catalog_factory(Arc::new(move |_: Option<&str>| {
            let search = SearchService::with_backends(
                None,
                Box::new(FakeSearch(catalog_queries.clone())),
            );
            vec![Arc::new(SearchInternetTool::new(search)) as Arc<dyn Tool>]
        }));

    Harness {
        service,
        script,
        queries,
    }
}

fn request(prompt: &str, session_id: Option<i64>) -> ChatRequest {
    let mut req = ChatRequest::new("openai", "sk-test", "gpt-4", prompt);
    req.session_id = session_id;
    req
}

#[tokio::test]
async fn blocking_chat_searches_then_answers_and_persists_both_turns() {
    let h = harness(vec![
        Ok(search_call("rust 2024 edition")),
        Ok("The 2024 edition is stable.".to_string()),
    ]);
    let session = h.service.create_session(Some("Rust")).unwrap();

    let reply = h
        .service
        .chat(request("What's new in Rust?", Some(session.id)))
        .await
        .unwrap();

    assert_eq!(reply.response, "The 2024 edition is stable.");
    assert_eq!(reply.model_used, "gpt-4");
    assert_eq!(reply.session_id, Some(session.id));
    assert_eq!(*h.queries.lock().unwrap(), vec!["rust 2024 edition"]);

    let requests = h.script.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].tools.is_some());
    assert!(requests[1].tools.is_none());
    assert!(requests[1].prompt.contains("Search Results:"));
    assert!(requests[1]
        .prompt
        .ends_with("please provide a comprehensive answer to: What's new in Rust?"));

    let turns = h.service.list_messages(session.id).unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].content, "What's new in Rust?");
    assert_eq!(turns[0].model_used, None);
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].model_used.as_deref(), Some("gpt-4"));
    assert_eq!(h.service.get_session(session.id).unwrap().message_count, 2);
}

#[tokio::test]
async fn blocking_chat_stops_at_iteration_cap() {
    let h = harness(vec![Ok(search_call("again"))]);

    let reply = h.service.chat(request("loop forever", None)).await.unwrap();

    assert_eq!(h.script.requests().len(), MAX_ITERATIONS);
    assert!(reply.response.contains("\"tool_calls\""));
}

#[tokio::test]
async fn blocking_chat_without_search_sends_no_tools() {
    let h = harness(vec![Ok("Plain answer.".to_string())]);
    let mut req = request("hi", None);
    req.enable_search = false;

    let reply = h.service.chat(req).await.unwrap();

    assert_eq!(reply.response, "Plain answer.");
    assert!(h.script.requests()[0].tools.is_none());
    assert!(h.queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn blocking_chat_rejects_missing_session_before_generating() {
    let h = harness(vec![Ok("never".to_string())]);

    let err = h.service.chat(request("hi", Some(404))).await.unwrap_err();

    assert!(matches!(err, GatewayError::NotFound(_)));
    assert_eq!(err.to_string(), "Session not found");
    assert!(h.script.requests().is_empty());
}

#[tokio::test]
async fn blocking_chat_surfaces_provider_failure() {
    let h = harness(vec![Err(GenerationError::Api {
        provider: "openai".to_string(),
        status: 401,
        body: "bad key".to_string(),
    })]);
    let session = h.service.create_session(None).unwrap();

    let err = h
        .service
        .chat(request("hi", Some(session.id)))
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 502);
    let turns = h.service.list_messages(session.id).unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, Role::User);
}

#[tokio::test]
async fn streamed_chat_reports_tools_then_text_and_persists_done() {
    let h = harness(vec![
        Ok(search_call("rust 2024 edition")),
        Ok("Edition 2024 is out.".to_string()),
    ]);
    let session = h.service.create_session(None).unwrap();

    let events: Vec<StreamEvent> = h
        .service
        .chat_stream(request("What's new in Rust?", Some(session.id)))
        .collect()
        .await;

    assert_eq!(
        events[0],
        StreamEvent::ToolCall("Searching the internet for: rust 2024 edition".to_string())
    );
    assert!(matches!(&events[1], StreamEvent::SearchResults(s) if s.starts_with("Search Results:")));
    assert_eq!(
        &events[2..],
        &[
            StreamEvent::Chunk("Edition ".to_string()),
            StreamEvent::Chunk("2024 ".to_string()),
            StreamEvent::Chunk("is ".to_string()),
            StreamEvent::Chunk("out.".to_string()),
            StreamEvent::Done("Edition 2024 is out.".to_string()),
        ]
    );

    let turns = h.service.list_messages(session.id).unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].content, "Edition 2024 is out.");
}

#[tokio::test]
async fn streamed_chat_failure_ends_with_single_error_and_keeps_only_prompt() {
    let h = harness(vec![Err(GenerationError::transport("openai", "connection reset"))]);
    let session = h.service.create_session(None).unwrap();

    let events: Vec<StreamEvent> = h
        .service
        .chat_stream(request("hi", Some(session.id)))
        .collect()
        .await;

    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StreamEvent::Error(m) if m.contains("connection reset")));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let turns = h.service.list_messages(session.id).unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, Role::User);
}

#[tokio::test]
async fn streamed_chat_frames_are_sse() {
    let h = harness(vec![Ok("Hello world".to_string())]);

    let frames: Vec<String> = h
        .service
        .chat_stream(request("hi", None))
        .map(|e| e.to_sse_frame())
        .collect()
        .await;

    assert_eq!(frames[0], "data: {\"type\":\"chunk\",\"content\":\"Hello \"}\n\n");
    assert_eq!(
        frames.last().unwrap(),
        "data: {\"type\":\"done\",\"content\":\"Hello world\"}\n\n"
    );
}

#[tokio::test]
async fn model_listing_and_key_validation_use_the_adapter() {
    let h = harness(vec![]);
    assert!(h.service.validate_key("openai", "sk-test").await);
    assert_eq!(h.service.list_models("openai", "sk-test").await[0].id, "gpt-4");
}
