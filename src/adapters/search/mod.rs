//! Internet search for the `search_internet` tool.
//!
//! A keyed backend is used when the caller supplies a search API key; any failure
//! there silently falls back to the keyless backend. Search never fails the
//! request: the worst outcome is an empty result list.

pub mod duckduckgo;
pub mod serper;

use crate::domain::models::SearchResult;
use crate::domain::ports::SearchBackend;
use std::fmt::Write;
use std::time::Duration;
use tracing::{info, warn};

pub use duckduckgo::DuckDuckGoBackend;
pub use serper::SerperBackend;

pub const DEFAULT_MAX_RESULTS: usize = 5;
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SearchService {
    keyed: Option<Box<dyn SearchBackend>>,
    keyless: Box<dyn SearchBackend>,
}

impl SearchService {
    /// Serper when `api_key` is non-empty, DuckDuckGo otherwise and as fallback.
    pub fn from_key(api_key: Option<&str>, timeout: Duration) -> Self {
        let keyed = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(|k| Box::new(SerperBackend::new(k.to_string(), timeout)) as Box<dyn SearchBackend>);

        Self {
            keyed,
            keyless: Box::new(DuckDuckGoBackend::new(timeout)),
        }
    }

    pub fn with_backends(
        keyed: Option<Box<dyn SearchBackend>>,
        keyless: Box<dyn SearchBackend>,
    ) -> Self {
        Self { keyed, keyless }
    }

    pub async fn search(&self, query: &str, max_results: usize) -> Vec<SearchResult> {
        if let Some(keyed) = &self.keyed {
            match keyed.search(query, max_results).await {
                Ok(results) => {
                    info!(backend = keyed.name(), query, count = results.len(), "Search complete");
                    return results;
                }
                Err(e) => warn!(
                    backend = keyed.name(),
                    query,
                    error = %e,
                    "Keyed search failed, falling back to keyless search"
                ),
            }
        }

        match self.keyless.search(query, max_results).await {
            Ok(results) => {
                info!(backend = self.keyless.name(), query, count = results.len(), "Search complete");
                results
            }
            Err(e) => {
                warn!(backend = self.keyless.name(), query, error = %e, "Keyless search failed");
                Vec::new()
            }
        }
    }
}

/// Numbered, model-readable rendering of search results.
pub fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No search results found.".to_string();
    }

    let mut formatted = String::from("Search Results:\n\n");
    for (i, r) in results.iter().enumerate() {
        let _ = write!(
            formatted,
            "{}. {}\n   URL: {}\n   {}\n\n",
            i + 1,
            r.title,
            r.url,
            r.snippet
        );
    }
    formatted
}
