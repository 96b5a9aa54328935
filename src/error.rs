use std::fmt;

use thiserror::Error;

/// Four-way classification callers match on to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    EmptyResponse,
    ModelNotFound,
}

/// One failed attempt inside the local-model retry sequence.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub strategy: String,
    /// 1-based attempt number within the strategy.
    pub attempt: u32,
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}: {}", self.strategy, self.attempt, self.message)
    }
}

#[derive(Debug, Error)]
pub enum AiClientError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error from {provider}: {message}")]
    Transport { provider: String, message: String },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("request {0} cancelled")]
    Cancelled(String),

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("model not found: {model} ({hint})")]
    ModelNotFound { model: String, hint: String },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("all {} local model attempts failed: {}", attempts.len(), join_attempts(attempts))]
    RetriesExhausted { attempts: Vec<AttemptFailure> },
}

fn join_attempts(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AiClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::InvalidRequest(_) => ErrorKind::Configuration,
            Self::EmptyResponse { .. } => ErrorKind::EmptyResponse,
            Self::ModelNotFound { .. } => ErrorKind::ModelNotFound,
            Self::RetriesExhausted { attempts } => attempts
                .last()
                .map(|a| a.kind)
                .unwrap_or(ErrorKind::Transport),
            Self::Transport { .. }
            | Self::Timeout(_)
            | Self::Cancelled(_)
            | Self::AuthFailed { .. }
            | Self::RateLimited { .. }
            | Self::Upstream { .. } => ErrorKind::Transport,
        }
    }

    /// HTTP status carried by the error, if the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => *status,
            Self::ModelNotFound { .. } => Some(404),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Whether the local-model retry loop may try again after this error.
    /// Configuration problems and cancellation end the sequence.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Configuration(_) | Self::InvalidRequest(_) | Self::Cancelled(_)
        )
    }

    /// Sanitized message for display. Never includes URLs or full upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Configuration(msg) => format!("configuration error: {msg}"),
            Self::InvalidRequest(msg) => format!("invalid request: {msg}"),
            Self::Transport { provider, .. } => format!("could not reach {provider}"),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::Cancelled(_) => "request was cancelled".to_string(),
            Self::EmptyResponse { provider } => format!("{provider} returned an empty response"),
            Self::ModelNotFound { model, hint } => format!("model not found: {model}. {hint}"),
            Self::AuthFailed { provider, .. } => {
                format!("authentication failed for {provider}: check the API key")
            }
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::Upstream {
                provider,
                message,
                status,
            } => {
                let preview = tail_chars(message, 200);
                match status {
                    Some(s) => format!("{provider} returned HTTP {s}: {preview}"),
                    None => format!("upstream error from {provider}: {preview}"),
                }
            }
            Self::RetriesExhausted { attempts } => match attempts.last() {
                Some(last) => format!(
                    "local model failed after {} attempts (last: {})",
                    attempts.len(),
                    last
                ),
                None => "local model failed".to_string(),
            },
        }
    }
}

/// Keep the last `max` chars, prefixed with "..." when cut.
pub(crate) fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    let tail: String = s.chars().skip(count - max).collect();
    format!("...{tail}")
}
