use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use parley_config::SearchConfig;

use super::Tool;

/// Web search via the Tavily API.
///
/// Never fails the calling turn: missing configuration, transport failures,
/// and non-2xx responses all come back as a JSON string with an `error`
/// field so the model sees a structured failure and can decide how to
/// respond. One network call per invocation, no retry.
pub struct WebSearchTool {
    config: SearchConfig,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn search(&self, query: &str) -> String {
        if self.config.api_key.is_empty() {
            return serde_json::json!({
                "error": "Web search is not available. API key not configured.",
            })
            .to_string();
        }

        info!("performing web search for: {query:?}");

        let body = serde_json::json!({
            "query": query,
            "search_depth": self.config.search_depth,
            "max_results": self.config.max_results,
            "include_answer": self.config.include_answer,
            "include_raw_content": false,
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!("web search request failed for {query:?}: {e}");
                return serde_json::json!({
                    "error": "An exception occurred during the search.",
                    "message": e.to_string(),
                })
                .to_string();
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            warn!("web search failed for {query:?} ({status}): {detail}");
            return serde_json::json!({
                "error": format!("Search failed with status: {status}"),
                "details": detail,
            })
            .to_string();
        }

        match response.json::<serde_json::Value>().await {
            Ok(data) => data.to_string(),
            Err(e) => serde_json::json!({
                "error": "Search returned an unreadable response.",
                "message": e.to_string(),
            })
            .to_string(),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information, news, facts, or research on any topic"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query to find information about"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let query = params
            .get("query")
            .and_then(|q| q.as_str())
            .unwrap_or_default();
        if query.is_empty() {
            return Ok(serde_json::json!({ "error": "query is required" }).to_string());
        }
        Ok(self.search(query).await)
    }
}
