//! Reasoning service abstraction and its OpenAI-compatible HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ServiceError;
use crate::request::{InferenceTask, Message, ResultOutput};

/// A service that completes inference tasks.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Runs one attempt of `task`.
    async fn complete(&self, task: &InferenceTask) -> Result<ResultOutput, ServiceError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Client for any `/chat/completions` endpoint.
pub struct OpenAiCompatibleService {
    api_base: String,
    api_key: Option<String>,
    model: String,
    timeout_secs: u64,
    http_client: Client,
}

impl OpenAiCompatibleService {
    /// # Arguments
    ///
    /// * `api_base` - Base URL, e.g. "http://localhost:8000/v1"
    /// * `api_key` - Bearer token, if the endpoint needs one
    /// * `model` - Model name sent with every request
    /// * `timeout_secs` - Per-request timeout
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, ServiceError> {
        let api_base = api_base.into();
        if api_base.is_empty() {
            return Err(ServiceError::Configuration("API base URL is empty".to_string()));
        }
        let http_client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ServiceError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            timeout_secs,
            http_client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ReasoningService for OpenAiCompatibleService {
    async fn complete(&self, task: &InferenceTask) -> Result<ResultOutput, ServiceError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = ChatRequest {
            model: &self.model,
            messages: &task.messages,
        };

        let mut request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        debug!(key = %task.key, attempt = task.attempt, "Submitting task");
        let response = request.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::Timeout(self.timeout_secs)
            } else {
                ServiceError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 429 {
                return Err(ServiceError::RateLimited);
            }
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&text)
                .map(|r| r.error.message)
                .unwrap_or(text);
            return Err(ServiceError::RequestFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                message
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
            .filter(|c| !c.trim().is_empty())
            .ok_or(ServiceError::EmptyResponse)?;
        Ok(ResultOutput::Text(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_base_rejected() {
        let result = OpenAiCompatibleService::new("", None, "model", 30);
        assert!(matches!(result, Err(ServiceError::Configuration(_))));
    }

    #[test]
    fn test_base_trailing_slash_trimmed() {
        let service =
            OpenAiCompatibleService::new("http://localhost:8000/v1/", None, "judge", 30).unwrap();
        assert_eq!(service.api_base, "http://localhost:8000/v1");
        assert_eq!(service.model(), "judge");
    }

    #[test]
    fn test_response_without_content() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}
