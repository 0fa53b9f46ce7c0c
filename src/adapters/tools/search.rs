use crate::adapters::search::{format_results, SearchService, DEFAULT_MAX_RESULTS};
use crate::domain::models::ToolDefinition;
use crate::domain::orchestrator::SEARCH_TOOL;
use crate::domain::ports::{Tool, ToolOutput};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct SearchInternetTool {
    search: SearchService,
    max_results: usize,
}

impl SearchInternetTool {
    pub fn new(search: SearchService) -> Self {
        Self {
            search,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }
}

#[async_trait]
impl Tool for SearchInternetTool {
    fn name(&self) -> &'static str {
        SEARCH_TOOL
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: SEARCH_TOOL.to_string(),
            description: "Search the internet for current information, news, facts, or any query. Use this when you need up-to-date information that might not be in your training data.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query to look up on the internet"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, input: Value) -> ToolOutput {
        let query = input
            .get("query")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or("Search query is required")?;

        let results = self.search.search(query, self.max_results).await;
        Ok(format_results(&results))
    }
}
