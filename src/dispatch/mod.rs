pub mod http;
pub mod lifecycle;
pub mod registry;
pub mod request;
pub mod retry;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::Provider;
use crate::error::AiClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Function => "function",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of a conversation. Order within a sequence is chronological.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Function,
            content: content.into(),
            name: Some(name.into()),
        }
    }
}

/// Caller-facing request. Not mutated after submission.
#[derive(Debug, Clone)]
pub struct AiRequestParams {
    pub provider: Provider,
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Accepted for interface parity; responses are always collected in full.
    pub stream: bool,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Lifecycle key. Generated when absent.
    pub request_id: Option<String>,
}

impl AiRequestParams {
    pub fn new(provider: Provider, model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            provider,
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            stream: false,
            api_key: None,
            base_url: None,
            request_id: None,
        }
    }

    pub fn validate(&self) -> Result<(), AiClientError> {
        if self.model.trim().is_empty() {
            return Err(AiClientError::InvalidRequest("model must not be empty".into()));
        }
        if self.messages.iter().all(|m| m.content.trim().is_empty()) {
            return Err(AiClientError::InvalidRequest(
                "messages must contain at least one non-empty message".into(),
            ));
        }
        if let Some(t) = self.temperature
            && (t.is_nan() || t.is_infinite() || !(0.0..=2.0).contains(&t))
        {
            return Err(AiClientError::InvalidRequest(format!(
                "temperature must be between 0.0 and 2.0, got {t}"
            )));
        }
        if self.max_tokens == Some(0) {
            return Err(AiClientError::InvalidRequest(
                "max_tokens must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Normalized result of any provider call. `text` is always present; an
/// unrecognized payload degrades to a diagnostic string instead of failing.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub text: String,
    pub usage: Option<Usage>,
}

/// What `AiClient::send_request` returns.
#[derive(Debug, Clone, PartialEq)]
pub struct AiResponse {
    pub text: String,
    pub request_id: String,
    pub usage: Option<Usage>,
}
