use serde::Deserialize;
use serde_json::Value;

use crate::config::Provider;
use crate::dispatch::{ParsedResponse, Usage};
use crate::parsers::{ResponseParser, degraded};

/// OpenAI-compatible `/chat/completions` bodies (OpenAI, Groq, Qwen, and the
/// Gemini compatibility endpoint). Text is `choices[0].message.content`;
/// legacy completion bodies with `choices[0].text` are accepted too.
pub struct OpenAiParser;

#[derive(Deserialize)]
pub(crate) struct ChatCompletion {
    choices: Vec<Choice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    total_tokens: Option<u64>,
}

impl From<OpenAiUsage> for Usage {
    fn from(u: OpenAiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u
                .total_tokens
                .unwrap_or(u.prompt_tokens.saturating_add(u.completion_tokens)),
        }
    }
}

impl ChatCompletion {
    pub(crate) fn decode(payload: &Value) -> Option<Self> {
        Self::deserialize(payload).ok()
    }

    pub(crate) fn into_parsed(self) -> Option<ParsedResponse> {
        let usage = self.usage.map(Usage::from);
        let first = self.choices.into_iter().next()?;
        let text = first.message.and_then(|m| m.content).or(first.text)?;
        Some(ParsedResponse { text, usage })
    }
}

impl ResponseParser for OpenAiParser {
    fn parse(&self, payload: &Value) -> ParsedResponse {
        ChatCompletion::decode(payload)
            .and_then(ChatCompletion::into_parsed)
            .unwrap_or_else(|| degraded(Provider::OpenAi, payload))
    }
}
