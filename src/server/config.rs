//! Server configuration
//!
//! Everything is read from environment variables (optionally via `.env`).

use std::time::Duration;
use thiserror::Error;

use crate::models::BusinessProfile;
use super::hours::{parse_weekly_hours, HoursError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Invalid business hours: {0}")]
    Hours(#[from] HoursError),
    #[error("{0}")]
    Invalid(String),
}

/// Language-model client and retry settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: i32,
    /// Per-attempt timeout, independent of the retry budget
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Linear backoff step: wait `attempt * step` after a failed attempt
    pub backoff_step: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-sonnet-4-5-20250514".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 400,
            timeout: Duration::from_secs(8),
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// `None` runs against the in-memory ledger
    pub database_url: Option<String>,
    /// Prefix for action URLs in markup; empty means relative paths
    pub webhook_base_url: String,
    pub llm: LlmConfig,
    /// Used when a webhook arrives and the business cannot be loaded
    pub fallback_forward_number: Option<String>,
    /// Business seeded into the in-memory ledger
    pub seed_business: Option<BusinessProfile>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: None,
            webhook_base_url: String::new(),
            llm: LlmConfig::default(),
            fallback_forward_number: None,
            seed_business: None,
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = LlmConfig::default();

        let llm = LlmConfig {
            api_key: get("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: get("ANTHROPIC_MODEL").unwrap_or(defaults.model),
            base_url: get("ANTHROPIC_BASE_URL").unwrap_or(defaults.base_url),
            max_tokens: parse_or(get("LLM_MAX_TOKENS"), "LLM_MAX_TOKENS", defaults.max_tokens)?,
            timeout: Duration::from_secs(parse_or(
                get("LLM_TIMEOUT_SECS"),
                "LLM_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            max_attempts: parse_or(get("LLM_MAX_ATTEMPTS"), "LLM_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_step: Duration::from_millis(parse_or(
                get("LLM_BACKOFF_MS"),
                "LLM_BACKOFF_MS",
                defaults.backoff_step.as_millis() as u64,
            )?),
        };

        let seed_business = match get("BUSINESS_NAME") {
            Some(name) => Some(BusinessProfile {
                id: 1,
                name,
                phone_number: get("BUSINESS_PHONE").unwrap_or_default(),
                personality: get("BUSINESS_PERSONALITY")
                    .unwrap_or_else(|| "friendly and professional".to_string()),
                timezone: get("BUSINESS_TIMEZONE").unwrap_or_else(|| "UTC".to_string()),
                hours: get("BUSINESS_HOURS").map(|h| parse_weekly_hours(&h)).transpose()?,
                forwarding_number: get("BUSINESS_FORWARD_NUMBER"),
                greeting: get("BUSINESS_GREETING"),
                voicemail_prompt: get("BUSINESS_VOICEMAIL_PROMPT"),
                auto_response_enabled: parse_or(
                    get("BUSINESS_AUTO_RESPONSE"),
                    "BUSINESS_AUTO_RESPONSE",
                    false,
                )?,
            }),
            None => None,
        };

        let config = Self {
            port: parse_or(get("PORT"), "PORT", 3000)?,
            database_url: get("DATABASE_URL"),
            webhook_base_url: get("WEBHOOK_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_default(),
            llm,
            fallback_forward_number: get("FALLBACK_FORWARD_NUMBER"),
            seed_business,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.max_attempts == 0 {
            return Err(ConfigError::Invalid("LLM_MAX_ATTEMPTS must be at least 1".to_string()));
        }
        if self.llm.timeout.is_zero() {
            return Err(ConfigError::Invalid("LLM_TIMEOUT_SECS must be positive".to_string()));
        }
        if self.database_url.is_none() && self.seed_business.is_none() {
            tracing::warn!("No DATABASE_URL and no BUSINESS_NAME: every call will be told the number is not in service");
        }
        if let Some(business) = &self.seed_business {
            if business.phone_number.is_empty() {
                return Err(ConfigError::Invalid("BUSINESS_PHONE is required with BUSINESS_NAME".to_string()));
            }
        }
        Ok(())
    }

    /// Absolute or relative URL for a webhook path such as `/voice/speech`.
    pub fn webhook_url(&self, path: &str) -> String {
        format!("{}{}", self.webhook_base_url, path)
    }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue { key, value: v }),
        None => Ok(default),
    }
}
