use crate::domain::models::SearchResult;
use crate::domain::ports::SearchBackend;
use crate::error::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const INSTANT_ANSWER_URL: &str = "https://api.duckduckgo.com/";
const HTML_SEARCH_URL: &str = "https://html.duckduckgo.com/html/";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

/// Keyless search backend.
///
/// Tries DuckDuckGo's instant-answer JSON interface first and scrapes the HTML
/// result page when that yields nothing. Both failing is an empty result set.
pub struct DuckDuckGoBackend {
    client: Client,
    api_url: String,
    html_url: String,
}

impl DuckDuckGoBackend {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_url: INSTANT_ANSWER_URL.to_string(),
            html_url: HTML_SEARCH_URL.to_string(),
        }
    }

    pub fn with_endpoints(mut self, api_url: impl Into<String>, html_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self.html_url = html_url.into();
        self
    }

    async fn search_structured(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let url = Url::parse_with_params(
            &self.api_url,
            &[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ],
        )
        .map_err(|e| SearchError::Transport(e.to_string()))?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status(status.as_u16()));
        }

        // The endpoint answers with `application/x-javascript`, so decode by hand.
        let body = response.text().await?;
        let answer: InstantAnswer =
            serde_json::from_str(&body).map_err(|e| SearchError::Parse(e.to_string()))?;

        Ok(answer.into_results(max_results))
    }

    async fn search_html(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let url = Url::parse_with_params(&self.html_url, &[("q", query)])
            .map_err(|e| SearchError::Transport(e.to_string()))?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        parse_result_page(&body, max_results)
    }
}

#[async_trait]
impl SearchBackend for DuckDuckGoBackend {
    fn name(&self) -> &'static str {
        "duckduckgo"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        match self.search_structured(query, max_results).await {
            Ok(results) if !results.is_empty() => return Ok(results),
            Ok(_) => debug!(query, "Instant answer had no results, scraping result page"),
            Err(e) => warn!(query, error = %e, "DuckDuckGo instant answer failed, scraping result page"),
        }

        match self.search_html(query, max_results).await {
            Ok(results) => Ok(results),
            Err(e) => {
                warn!(query, error = %e, "DuckDuckGo HTML fallback failed");
                Ok(Vec::new())
            }
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    heading: String,
    #[serde(default)]
    abstract_text: String,
    #[serde(rename = "AbstractURL", default)]
    abstract_url: String,
    #[serde(default)]
    related_topics: Vec<RelatedTopic>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RelatedTopic {
    #[serde(default)]
    text: String,
    #[serde(rename = "FirstURL", default)]
    first_url: String,
    /// Present on topic groups instead of `text`/`first_url`.
    #[serde(default)]
    topics: Vec<RelatedTopic>,
}

impl InstantAnswer {
    fn into_results(self, max_results: usize) -> Vec<SearchResult> {
        let mut results = Vec::new();

        if !self.abstract_text.is_empty() && !self.abstract_url.is_empty() {
            results.push(SearchResult {
                title: self.heading.clone(),
                snippet: self.abstract_text,
                url: self.abstract_url,
                source: "DuckDuckGo".to_string(),
            });
        }

        let mut topics: Vec<RelatedTopic> = Vec::new();
        for topic in self.related_topics {
            if topic.topics.is_empty() {
                topics.push(topic);
            } else {
                topics.extend(topic.topics);
            }
        }

        for topic in topics {
            if topic.text.is_empty() || topic.first_url.is_empty() {
                continue;
            }
            let title = topic
                .text
                .split(" - ")
                .next()
                .unwrap_or(&topic.text)
                .to_string();
            results.push(SearchResult {
                title,
                snippet: topic.text,
                url: topic.first_url,
                source: "DuckDuckGo".to_string(),
            });
        }

        results.truncate(max_results);
        results
    }
}

fn selector(css: &str) -> Result<Selector, SearchError> {
    Selector::parse(css).map_err(|e| SearchError::Parse(format!("selector {}: {:?}", css, e)))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Result links on the HTML page go through a `/l/?uddg=<target>` redirect.
fn resolve_result_href(href: &str) -> String {
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else {
        href.to_string()
    };

    Url::parse(&absolute)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == "uddg")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or(absolute)
}

fn parse_result_page(body: &str, max_results: usize) -> Result<Vec<SearchResult>, SearchError> {
    let result_sel = selector(".result")?;
    let title_sel = selector(".result__a")?;
    let snippet_sel = selector(".result__snippet")?;

    let document = Html::parse_document(body);
    let mut results = Vec::new();

    for result in document.select(&result_sel).take(max_results) {
        let (Some(title), Some(snippet)) = (
            result.select(&title_sel).next(),
            result.select(&snippet_sel).next(),
        ) else {
            continue;
        };

        results.push(SearchResult {
            title: collapse_whitespace(&title.text().collect::<String>()),
            snippet: collapse_whitespace(&snippet.text().collect::<String>()),
            url: resolve_result_href(title.value().attr("href").unwrap_or_default()),
            source: "DuckDuckGo".to_string(),
        });
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RESULT_PAGE: &str = r#"
        <html><body>
          <div class="result">
            <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.rust-lang.org%2F&amp;rut=abc">Rust   Programming Language</a>
            <a class="result__snippet">A language empowering everyone.</a>
          </div>
          <div class="result">
            <a class="result__a" href="https://blog.rust-lang.org/">Rust Blog</a>
          </div>
          <div class="result">
            <a class="result__a" href="https://doc.rust-lang.org/book/">The Book</a>
            <a class="result__snippet">Learn Rust.</a>
          </div>
        </body></html>
    "#;

    fn backend(server: &MockServer) -> DuckDuckGoBackend {
        DuckDuckGoBackend::new(Duration::from_secs(5)).with_endpoints(
            format!("{}/api", server.uri()),
            format!("{}/html", server.uri()),
        )
    }

    #[test]
    fn test_parse_result_page_skips_incomplete_entries() {
        let results = parse_result_page(RESULT_PAGE, 5).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "Rust Programming Language");
        assert_eq!(results[0].url, "https://www.rust-lang.org/");
        assert_eq!(results[1].url, "https://doc.rust-lang.org/book/");
    }

    #[tokio::test]
    async fn test_structured_results_are_preferred() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .and(query_param("q", "rust"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Heading": "Rust",
                "AbstractText": "Rust is a systems programming language.",
                "AbstractURL": "https://en.wikipedia.org/wiki/Rust_(programming_language)",
                "RelatedTopics": [
                    { "Text": "Cargo - Rust package manager", "FirstURL": "https://duckduckgo.com/Cargo" },
                    { "Name": "Tools", "Topics": [
                        { "Text": "Clippy - Rust linter", "FirstURL": "https://duckduckgo.com/Clippy" }
                    ]}
                ]
            })))
            .mount(&server)
            .await;

        let results = backend(&server).search("rust", 5).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].title, "Rust");
        assert_eq!(results[1].title, "Cargo");
        assert_eq!(results[2].snippet, "Clippy - Rust linter");
    }

    #[tokio::test]
    async fn test_empty_instant_answer_falls_back_to_scrape() {
        let server = MockServer::start().await;
        Mock::given(path("/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Heading": "" })))
            .mount(&server)
            .await;
        Mock::given(path("/html"))
            .and(query_param("q", "rust"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RESULT_PAGE))
            .mount(&server)
            .await;

        let results = backend(&server).search("rust", 1).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "DuckDuckGo");
    }

    #[tokio::test]
    async fn test_both_strategies_failing_is_empty_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let results = backend(&server).search("rust", 5).await.unwrap();
        assert!(results.is_empty());
    }
}
