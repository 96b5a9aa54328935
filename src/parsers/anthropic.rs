use serde::Deserialize;
use serde_json::Value;

use crate::config::Provider;
use crate::dispatch::{ParsedResponse, Usage};
use crate::parsers::{ResponseParser, degraded};

/// Anthropic Messages API body: `{"content": [{"type": "text", "text": ...}], "usage": {...}}`.
/// Text blocks are joined in order; other block types are ignored.
pub struct AnthropicParser;

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: Option<String>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl ResponseParser for AnthropicParser {
    fn parse(&self, payload: &Value) -> ParsedResponse {
        let Ok(resp) = MessagesResponse::deserialize(payload) else {
            return degraded(Provider::Anthropic, payload);
        };

        let parts: Vec<String> = resp
            .content
            .into_iter()
            .filter(|b| b.block_type.as_deref().is_none_or(|t| t == "text"))
            .filter_map(|b| b.text)
            .collect();

        if parts.is_empty() {
            return degraded(Provider::Anthropic, payload);
        }

        ParsedResponse {
            text: parts.concat(),
            usage: resp
                .usage
                .map(|u| Usage::new(u.input_tokens, u.output_tokens)),
        }
    }
}
