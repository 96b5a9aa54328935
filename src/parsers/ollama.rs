use serde::Deserialize;
use serde_json::Value;

use crate::config::Provider;
use crate::dispatch::{ParsedResponse, Usage};
use crate::parsers::{ResponseParser, payload_preview, stream};

/// Alternate text fields some local runtimes and proxies use.
const ALT_TEXT_FIELDS: &[&str] = &["output", "text", "content", "completion", "answer"];

/// Local model server responses. Never fails: see [`LocalPayload::classify`]
/// for the order in which shapes are tried.
pub struct OllamaParser;

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub response: String,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: ChatBodyMessage,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ChatBodyMessage {
    pub content: String,
}

/// Recognized shapes of a local-model payload.
#[derive(Debug)]
pub enum LocalPayload {
    /// `/api/generate`: `{"response": ...}`.
    Generate(GenerateBody),
    /// `/api/chat`: `{"message": {"content": ...}}`.
    Chat(ChatBody),
    /// Array or NDJSON fragments.
    Stream(Value),
    /// Text found under one of [`ALT_TEXT_FIELDS`].
    AltField { field: &'static str, text: String },
    Unrecognized(Value),
}

impl LocalPayload {
    /// Generate, chat, stream, alternate field, then unrecognized.
    pub fn classify(payload: &Value) -> Self {
        if payload.get("response").is_some_and(Value::is_string)
            && let Ok(body) = GenerateBody::deserialize(payload)
        {
            return Self::Generate(body);
        }
        if payload.pointer("/message/content").is_some_and(Value::is_string)
            && let Ok(body) = ChatBody::deserialize(payload)
        {
            return Self::Chat(body);
        }
        if stream::looks_like_stream(payload) {
            return Self::Stream(payload.clone());
        }
        if let Some((field, text)) = ALT_TEXT_FIELDS
            .iter()
            .find_map(|f| payload.get(*f).and_then(Value::as_str).map(|t| (*f, t)))
        {
            return Self::AltField {
                field,
                text: text.to_string(),
            };
        }
        Self::Unrecognized(payload.clone())
    }
}

fn eval_usage(prompt: Option<u64>, completion: Option<u64>) -> Option<Usage> {
    (prompt.is_some() || completion.is_some())
        .then(|| Usage::new(prompt.unwrap_or(0), completion.unwrap_or(0)))
}

/// Last resort: the whole payload as text. A plain string body is returned as is.
fn stringify(payload: &Value) -> ParsedResponse {
    tracing::warn!(
        provider = %Provider::Ollama,
        preview = %payload_preview(payload),
        "unrecognized local model response, returning raw payload"
    );
    let text = match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    ParsedResponse { text, usage: None }
}

impl ResponseParser for OllamaParser {
    fn parse(&self, payload: &Value) -> ParsedResponse {
        match LocalPayload::classify(payload) {
            LocalPayload::Generate(body) => ParsedResponse {
                text: body.response,
                usage: eval_usage(body.prompt_eval_count, body.eval_count),
            },
            LocalPayload::Chat(body) => ParsedResponse {
                text: body.message.content,
                usage: eval_usage(body.prompt_eval_count, body.eval_count),
            },
            LocalPayload::Stream(raw) => {
                stream::extract(&raw).unwrap_or_else(|| stringify(&raw))
            }
            LocalPayload::AltField { field, text } => {
                tracing::debug!(field, "local model text found in alternate field");
                ParsedResponse { text, usage: None }
            }
            LocalPayload::Unrecognized(raw) => stringify(&raw),
        }
    }
}
