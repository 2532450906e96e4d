//! External AI collaborators: text completion and knowledge-base search.
//!
//! Both are trait seams so the pipeline can be tested against mocks. The
//! production implementations live in [`http`].

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

pub use http::{HttpSearchService, OpenAiCompletionService};

/// Chat-style completion backend.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// One-shot completion: a system instruction plus a user turn.
    async fn complete(&self, system: &str, user: &str) -> Result<String, ServiceError>;
}

/// One knowledge-base excerpt returned by search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub score: f32,
}

/// Knowledge-base search backend.
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ServiceError>;
}

/// Strip a markdown code fence and return the first top-level JSON object in
/// the text. Models routinely wrap JSON in ```json fences or prepend prose.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let inner = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.rsplit_once("```").map(|(body, _)| body).unwrap_or(rest)
    } else {
        trimmed
    };

    let start = inner.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in inner[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&inner[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}
