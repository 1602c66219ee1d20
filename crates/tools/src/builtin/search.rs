//! Web search through an external data provider.
//!
//! The endpoint is optional: when unconfigured the tool stays registered
//! so the model sees a stable tool surface, but invocations report the
//! capability as unavailable with a suggested alternative.

use std::sync::Arc;

use serde_json::Value;

use relay_domain::cancel::CancelToken;
use relay_domain::error::{Error, Result};

use crate::registry::{ToolContext, ToolHandler, ToolSpec};

struct WebSearch {
    client: reqwest::Client,
    endpoint: Option<String>,
}

#[async_trait::async_trait]
impl ToolHandler for WebSearch {
    async fn invoke(&self, _ctx: &ToolContext, arguments: Value, cancel: &CancelToken) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let query = arguments
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::ToolFailure("missing required parameter: query".into()))?;

        let Some(endpoint) = &self.endpoint else {
            return Err(Error::ToolFailure(
                "web search is not configured; use execute_command with curl as an alternative".into(),
            ));
        };

        let limit = arguments.get("limit").and_then(|v| v.as_u64()).unwrap_or(10);
        let response = self
            .client
            .post(endpoint)
            .json(&serde_json::json!({ "query": query, "limit": limit }))
            .send()
            .await
            .map_err(|e| Error::UpstreamFailure(format!("search provider: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamFailure(format!("search provider returned {status}")));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| Error::UpstreamFailure(format!("decoding search results: {e}")))
    }
}

pub fn web_search_spec(endpoint: Option<String>) -> ToolSpec {
    ToolSpec {
        name: "web_search".into(),
        description: "Search the web and return ranked results.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "limit": { "type": "integer", "description": "Max results (default 10)" }
            },
            "required": ["query"]
        }),
        xml: None,
        handler: Arc::new(WebSearch { client: reqwest::Client::new(), endpoint }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_endpoint_reports_unavailable() {
        let spec = web_search_spec(None);
        let err = spec
            .handler
            .invoke(
                &ToolContext::default(),
                serde_json::json!({ "query": "rust" }),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolFailure(_)));
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn missing_query_rejected() {
        let spec = web_search_spec(Some("https://search.test".into()));
        let err = spec
            .handler
            .invoke(&ToolContext::default(), serde_json::json!({}), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("query"));
    }
}
