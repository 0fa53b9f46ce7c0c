use crate::domain::models::{ToolCall, ToolDefinition, ToolResult};
use crate::domain::ports::Tool;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Name of the internet search tool.
pub const SEARCH_TOOL: &str = "search_internet";

/// Runs the tool calls a model asks for against a fixed catalog.
///
/// Tool failures never escape: every outcome, including unknown tools and bad
/// arguments, comes back as text the model can read on its next turn.
pub struct ToolOrchestrator {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolOrchestrator {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    pub fn get_tools(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    pub async fn execute(&self, tool_name: &str, arguments: &Value) -> String {
        let Some(tool) = self.tools.iter().find(|t| t.name() == tool_name) else {
            warn!(tool = tool_name, "Model requested an unknown tool");
            return format!("Error: Unknown tool '{}'", tool_name);
        };

        debug!(tool = tool_name, %arguments, "Executing tool");
        match AssertUnwindSafe(tool.execute(arguments.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => format!("Error: {}", err),
            Err(_) => {
                error!(tool = tool_name, "Tool panicked during execution");
                format!("Error executing tool: '{}' failed unexpectedly", tool_name)
            }
        }
    }

    /// One result per call, in input order, each carrying its call's id.
    pub async fn process_tool_calls(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let content = self.execute(&call.name, &call.arguments).await;
            results.push(ToolResult {
                call_id: call.id.clone(),
                name: call.name.clone(),
                content,
            });
        }
        results
    }

    /// Human-readable line announcing a call, used for `tool_call` stream events.
    pub fn describe_call(&self, call: &ToolCall) -> String {
        if call.name == SEARCH_TOOL {
            if let Some(query) = call.arguments.get("query").and_then(|q| q.as_str()) {
                return format!("Searching the internet for: {}", query);
            }
        }
        format!("Calling tool '{}' with {}", call.name, call.arguments)
    }
}
