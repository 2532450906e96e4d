//! HTTP implementations of the AI service traits.
//!
//! The completion client speaks the OpenAI-compatible chat completions wire
//! format, which every major provider and most self-hosted gateways accept.
//! The search client posts to a simple JSON endpoint.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ServiceError;
use crate::services::{CompletionService, SearchHit, SearchService};

/// OpenAI-compatible chat completions client.
pub struct OpenAiCompletionService {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl OpenAiCompletionService {
    pub fn new(base_url: impl Into<String>, api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            model: model.into(),
        }
    }

    /// Build from `COMPLETION_API_KEY` (+ optional `COMPLETION_API_URL`,
    /// `COMPLETION_MODEL`). Returns `None` when no key is configured.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("COMPLETION_API_KEY").ok()?;
        let base_url = std::env::var("COMPLETION_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model =
            std::env::var("COMPLETION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Some(Self::new(base_url, SecretString::from(api_key), model))
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl CompletionService for OpenAiCompletionService {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ServiceError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::Completion(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Completion(format!(
                "HTTP {status}: {text}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::InvalidResponse("empty choices".to_string()))?;

        debug!(model = %self.model, chars = content.len(), "Completion received");
        Ok(content)
    }
}

/// Knowledge-base search over a JSON HTTP endpoint.
pub struct HttpSearchService {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpSearchService {
    pub fn new(endpoint: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }

    /// Build from `SEARCH_API_URL` (+ optional `SEARCH_API_KEY`). Returns
    /// `None` when no endpoint is configured.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("SEARCH_API_URL").ok()?;
        let api_key = std::env::var("SEARCH_API_KEY").ok().map(SecretString::from);
        Some(Self::new(endpoint, api_key))
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[async_trait]
impl SearchService for HttpSearchService {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ServiceError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&json!({"query": query, "limit": limit}));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::Search(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Search(format!("HTTP {status}")));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        debug!(query, hits = parsed.hits.len(), "Search completed");
        Ok(parsed.hits)
    }
}
