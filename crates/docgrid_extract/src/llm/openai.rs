//! OpenAI-compatible chat-completions client.
//!
//! POSTs the project's endpoint with its API key as bearer and the
//! per-project request timeout. Any endpoint speaking the chat-completions
//! protocol works; only `choices[0].message.content` and the optional
//! `usage` block are read back.

use std::time::Duration;

use docgrid_protocol::Project;
use reqwest::Client;
use serde::Deserialize;

use super::{ChatCompletion, ChatRequest, LlmError, VisionClient};
use async_trait::async_trait;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<i64>,
}

/// HTTP client for one project's endpoint.
pub struct OpenAiClient {
    client: Client,
    endpoint_url: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(endpoint_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            endpoint_url: endpoint_url.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    /// Client configured from a project's LLM settings.
    pub fn for_project(project: &Project) -> Self {
        Self::new(
            project.llm.endpoint_url.clone(),
            project.llm.api_key.clone(),
            Duration::from_secs(project.request_timeout_secs),
        )
    }
}

#[async_trait]
impl VisionClient for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        let response = self
            .client
            .post(&self.endpoint_url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 408 and 429 are throttling/timeout conditions worth retrying.
            let code = status.as_u16();
            if status.is_server_error() || code == 408 || code == 429 {
                return Err(LlmError::Network(format!("HTTP {code}: {body}")));
            }
            return Err(LlmError::Client { status: code, body });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("response has no assistant content".to_string()))?;

        Ok(ChatCompletion {
            content,
            model: body.model.unwrap_or_else(|| request.model.clone()),
            tokens_used: body.usage.and_then(|u| u.total_tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_envelope_decodes() {
        let raw = r#"{
            "id": "chatcmpl-1",
            "model": "vision-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "{\"extractions\":[]}"}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120}
        }"#;
        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            response.choices[0].message.content.as_deref(),
            Some("{\"extractions\":[]}")
        );
        assert_eq!(response.usage.unwrap().total_tokens, Some(120));
    }

    #[test]
    fn test_response_without_usage_decodes() {
        let raw = r#"{"choices": [{"message": {"content": "ok"}}]}"#;
        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        assert!(response.usage.is_none());
        assert!(response.model.is_none());
    }
}
