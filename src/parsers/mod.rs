pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod stream;

use serde_json::Value;

use crate::config::Provider;
use crate::dispatch::ParsedResponse;
use crate::error::{AiClientError, tail_chars};

use anthropic::AnthropicParser;
use gemini::GeminiParser;
use ollama::OllamaParser;
use openai::OpenAiParser;

/// Max chars of a raw payload echoed into a degraded response.
const DIAGNOSTIC_PREVIEW_CHARS: usize = 500;

/// Normalizes one provider's decoded response body into `{text, usage}`.
/// Shape problems degrade to a diagnostic text instead of failing.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, payload: &Value) -> ParsedResponse;
}

pub fn parser_for(provider: Provider) -> &'static dyn ResponseParser {
    match provider {
        Provider::Anthropic => &AnthropicParser,
        Provider::Gemini => &GeminiParser,
        Provider::Ollama => &OllamaParser,
        Provider::OpenAi | Provider::Qwen | Provider::Groq => &OpenAiParser,
    }
}

/// Decode a raw body and hand it to the provider's parser. An empty body or a
/// JSON `null` is the only hard failure; bodies that are not JSON are passed on
/// as a string payload (local servers sometimes answer with NDJSON).
pub fn parse_response(provider: Provider, body: &[u8]) -> Result<ParsedResponse, AiClientError> {
    let empty = || AiClientError::EmptyResponse {
        provider: provider.to_string(),
    };

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(empty());
    }

    let payload = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Null) => return Err(empty()),
        Ok(v) => v,
        Err(_) => Value::String(String::from_utf8_lossy(body).into_owned()),
    };

    Ok(parser_for(provider).parse(&payload))
}

/// Best-effort result for a payload no rule recognized.
pub(crate) fn degraded(provider: Provider, payload: &Value) -> ParsedResponse {
    let raw = match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    tracing::warn!(
        provider = %provider,
        bytes = raw.len(),
        "unrecognized response shape, returning diagnostic text"
    );
    let preview: String = raw.chars().take(DIAGNOSTIC_PREVIEW_CHARS).collect();
    let suffix = if preview.len() < raw.len() { "..." } else { "" };
    ParsedResponse {
        text: format!("[unrecognized {provider} response] {preview}{suffix}"),
        usage: None,
    }
}

/// Short, bounded rendering of a payload for log fields.
pub(crate) fn payload_preview(payload: &Value) -> String {
    tail_chars(&payload.to_string(), 200)
}
