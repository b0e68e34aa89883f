//! HTTP client for the LLM endpoint (Ollama-compatible chat API)
//!
//! The endpoint is a single shared resource: every client instance holds
//! the same semaphore, so total in-flight calls stay bounded regardless
//! of how many engines are running.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::LlmConfig;

/// Classified LLM failure. Retryability drives attempt accounting:
/// transient failures consume one extraction attempt, they never crash
/// the pipeline.
#[derive(Debug, Clone)]
pub enum LlmError {
    /// Request exceeded the configured timeout
    Timeout(String),
    /// Connection-level failure
    Network(String),
    /// 5xx from the endpoint
    Server(String),
    /// 429 from the endpoint
    RateLimited(String),
    /// 4xx - the request itself is wrong, retrying won't help
    InvalidRequest(String),
    /// Response body didn't match the expected shape
    Parse(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_)
                | LlmError::Network(_)
                | LlmError::Server(_)
                | LlmError::RateLimited(_)
        )
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::Timeout(msg) => write!(f, "LLM timeout: {}", msg),
            LlmError::Network(msg) => write!(f, "LLM network error: {}", msg),
            LlmError::Server(msg) => write!(f, "LLM server error: {}", msg),
            LlmError::RateLimited(msg) => write!(f, "LLM rate limited: {}", msg),
            LlmError::InvalidRequest(msg) => write!(f, "LLM invalid request: {}", msg),
            LlmError::Parse(msg) => write!(f, "LLM parse error: {}", msg),
        }
    }
}

impl std::error::Error for LlmError {}

/// Seam between the extraction/analysis engines and the actual endpoint.
/// Tests plug in scripted models.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

/// Chat client for one model on the shared endpoint
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    semaphore: Arc<Semaphore>,
}

impl LlmClient {
    pub fn new(config: &LlmConfig, model: String, semaphore: Arc<Semaphore>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model,
            semaphore,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Is the endpoint reachable with this model loaded?
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        let resp = match self.client.get(&url).timeout(Duration::from_secs(10)).send().await {
            Ok(r) => r,
            Err(_) => return false,
        };
        if !resp.status().is_success() {
            return false;
        }
        match resp.json::<TagsResponse>().await {
            Ok(tags) => tags.models.iter().any(|m| m.name.contains(self.model.as_str())),
            Err(_) => false,
        }
    }

    fn classify_send_error(err: reqwest::Error) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else if err.is_connect() {
            LlmError::Network(err.to_string())
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        // Bound in-flight calls against the shared endpoint
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| LlmError::Network("LLM semaphore closed".into()))?;

        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(ChatMessage { role: "system", content: system.to_string() });
        }
        messages.push(ChatMessage { role: "user", content: prompt.to_string() });

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            stream: false,
            options: ChatOptions { temperature, num_predict: max_tokens },
        };

        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(Self::classify_send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => LlmError::RateLimited(format!("{}: {}", status, body)),
                500..=599 => LlmError::Server(format!("{}: {}", status, body)),
                _ => LlmError::InvalidRequest(format!("{}: {}", status, body)),
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("chat response decode: {}", e)))?;
        Ok(parsed.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::Timeout("t".into()).is_retryable());
        assert!(LlmError::Network("n".into()).is_retryable());
        assert!(LlmError::Server("500".into()).is_retryable());
        assert!(LlmError::RateLimited("429".into()).is_retryable());
        assert!(!LlmError::InvalidRequest("400".into()).is_retryable());
        assert!(!LlmError::Parse("bad".into()).is_retryable());
    }
}
