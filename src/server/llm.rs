//! Language-model service boundary
//!
//! The orchestrator talks to the model only through [`LanguageModel`], so the
//! HTTP client can be swapped for a test double.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub max_tokens: i32,
    pub temperature: Option<f64>,
    /// Ask the service for a bare JSON object
    pub json_only: bool,
}

/// Errors that can occur when calling the language-model service
#[derive(Debug, thiserror::Error)]
#[allow(clippy::enum_variant_names)]
pub enum LanguageModelError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error ({status}): {message}")]
    ApiError {
        status: u16,
        message: String,
        error_type: String,
    },

    #[error("Parse error: {0}")]
    ParseError(String),
}

#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    /// Return the model's text reply for one request.
    async fn complete(&self, request: CompletionRequest) -> Result<String, LanguageModelError>;
}
