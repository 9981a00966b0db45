//! LLM client abstraction.
//!
//! A single trait (`VisionClient`) fronts the OpenAI-compatible
//! chat-completions endpoint, so pipelines can run against the real HTTP
//! client, a rate-limited wrapper, or a scripted mock. The core does not
//! depend on streaming, function calling, or tool use: one request, one
//! assistant message.

pub mod mock;
pub mod openai;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::MockVisionClient;
pub use openai::OpenAiClient;

// =============================================================================
// Error Types
// =============================================================================

/// Errors from the LLM endpoint, classified per the retry policy: transport
/// failures, timeouts, 5xx, 408 and 429 are retriable; other 4xx are not.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Transport failure, timeout, 5xx, or throttling response.
    #[error("LLM transport error: {0}")]
    Network(String),

    /// Non-retriable endpoint rejection (4xx excluding 408/429).
    #[error("LLM endpoint rejected the request (HTTP {status}): {body}")]
    Client { status: u16, body: String },

    /// The endpoint answered 2xx but the envelope was not chat-completions.
    #[error("invalid LLM response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, LlmError::Network(_))
    }
}

// =============================================================================
// Request / Response Types (OpenAI chat-completions shape)
// =============================================================================

/// One content part of a user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Base64 data URL part for raw image bytes.
    pub fn image(bytes: &[u8], mime_type: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{mime_type};base64,{encoded}"),
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn user(content: Vec<ContentPart>) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

/// Request body for the chat-completions endpoint. Temperature is left
/// unset so the model default applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Flattened assistant reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    pub model: String,
    pub tokens_used: Option<i64>,
}

// =============================================================================
// Client Trait
// =============================================================================

/// A chat-completions endpoint that accepts interleaved image and text
/// content parts. Implementations must be thread-safe.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError>;
}
