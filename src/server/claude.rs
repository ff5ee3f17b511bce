//! Claude API client
//!
//! Anthropic Messages API implementation of [`LanguageModel`].

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::config::LlmConfig;
use super::llm::{CompletionRequest, LanguageModel, LanguageModelError, Message};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Messages API client
#[derive(Clone)]
pub struct ClaudeClient {
    http: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: i32,
    system: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    #[serde(default)]
    content: Vec<ReplyBlock>,
    stop_reason: Option<String>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplyBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TokenUsage {
    input_tokens: i32,
    output_tokens: i32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

impl MessagesReply {
    fn joined_text(self) -> String {
        self.content
            .into_iter()
            .filter_map(|block| match block {
                ReplyBlock::Text { text } => Some(text),
                ReplyBlock::Other => None,
            })
            .collect()
    }
}

fn api_error(status: u16, body: String) -> LanguageModelError {
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => LanguageModelError::ApiError {
            status,
            message: envelope.error.message,
            error_type: envelope.error.kind,
        },
        Err(_) => LanguageModelError::ApiError {
            status,
            message: body,
            error_type: "unknown".to_string(),
        },
    }
}

impl ClaudeClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
            model,
            endpoint: format!("{}/v1/messages", base_url.trim_end_matches('/')),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            config.model.clone(),
            config.base_url.clone(),
        )
    }

    async fn post_messages(&self, body: &MessagesBody<'_>) -> Result<MessagesReply, LanguageModelError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| LanguageModelError::NetworkError(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LanguageModelError::NetworkError(e.to_string()))?;

        if !status.is_success() {
            return Err(api_error(status.as_u16(), text));
        }

        serde_json::from_str(&text).map_err(|e| LanguageModelError::ParseError(e.to_string()))
    }
}

#[async_trait::async_trait]
impl LanguageModel for ClaudeClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LanguageModelError> {
        let mut messages = request.messages;
        // Prefilled "{" keeps the reply a bare JSON object
        if request.json_only {
            messages.push(Message::assistant("{"));
        }

        let reply = self
            .post_messages(&MessagesBody {
                model: &self.model,
                max_tokens: request.max_tokens,
                system: &request.system,
                messages: &messages,
                temperature: request.temperature,
            })
            .await?;

        if let Some(usage) = &reply.usage {
            tracing::debug!(
                "Model reply: {} in / {} out tokens, stop_reason={:?}",
                usage.input_tokens,
                usage.output_tokens,
                reply.stop_reason
            );
        }

        let text = reply.joined_text();
        Ok(if request.json_only { format!("{{{}", text) } else { text })
    }
}
