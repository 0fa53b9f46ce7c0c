use crate::domain::models::SearchResult;
use crate::domain::ports::SearchBackend;
use crate::error::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SERPER_URL: &str = "https://google.serper.dev/search";

/// Keyed search backend (Serper's Google search API).
pub struct SerperBackend {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl SerperBackend {
    pub fn new(api_key: String, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key,
            endpoint: SERPER_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Serialize)]
struct SerperRequest<'a> {
    q: &'a str,
    num: usize,
}

#[derive(Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperOrganic>,
}

#[derive(Deserialize)]
struct SerperOrganic {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    link: String,
}

#[async_trait]
impl SearchBackend for SerperBackend {
    fn name(&self) -> &'static str {
        "serper"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        debug!(query, max_results, "Serper search");

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&SerperRequest {
                q: query,
                num: max_results,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status(status.as_u16()));
        }

        let body: SerperResponse = response.json().await?;
        Ok(body
            .organic
            .into_iter()
            .take(max_results)
            .map(|item| SearchResult {
                title: item.title,
                snippet: item.snippet,
                url: item.link,
                source: "Serper".to_string(),
            })
            .collect())
    }
}
