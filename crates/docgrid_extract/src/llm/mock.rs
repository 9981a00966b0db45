//! Scripted client for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ChatCompletion, ChatRequest, LlmError, VisionClient};

/// Replays scripted completions in order and records every request it saw.
/// An optional per-call delay makes concurrency observable under a paused
/// tokio clock.
#[derive(Default)]
pub struct MockVisionClient {
    script: Mutex<VecDeque<Result<ChatCompletion, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    delay: Option<Duration>,
}

impl MockVisionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a successful completion with the given assistant content.
    pub fn push_content(&self, content: impl Into<String>) {
        self.push(Ok(ChatCompletion {
            content: content.into(),
            model: "mock-vision".to_string(),
            tokens_used: Some(128),
        }));
    }

    pub fn push_error(&self, error: LlmError) {
        self.push(Err(error));
    }

    pub fn push(&self, result: Result<ChatCompletion, LlmError>) {
        self.script.lock().unwrap().push_back(result);
    }

    /// Requests observed so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl VisionClient for MockVisionClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Network("mock script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, ContentPart};

    #[tokio::test]
    async fn test_mock_replays_in_order_and_records() {
        let mock = MockVisionClient::new();
        mock.push_content("first");
        mock.push_content("second");

        let request = ChatRequest {
            model: "vision-1".to_string(),
            messages: vec![ChatMessage::user(vec![ContentPart::text("hi")])],
            max_tokens: None,
        };

        assert_eq!(mock.complete(&request).await.unwrap().content, "first");
        assert_eq!(mock.complete(&request).await.unwrap().content, "second");
        assert!(mock.complete(&request).await.is_err());
        assert_eq!(mock.call_count(), 3);
    }
}
