use serde::Deserialize;
use serde_json::Value;

use crate::config::Provider;
use crate::dispatch::{ParsedResponse, Usage};
use crate::parsers::openai::ChatCompletion;
use crate::parsers::{ResponseParser, degraded};

/// Gemini answers in the OpenAI-compatible shape on its compatibility
/// endpoint and in the native `candidates[0].content.parts[*].text` shape
/// elsewhere (some proxies pass it through untouched). Both are accepted.
pub struct GeminiParser;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

fn parse_native(payload: &Value) -> Option<ParsedResponse> {
    let resp = GenerateContentResponse::deserialize(payload).ok()?;
    let usage = resp
        .usage_metadata
        .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count));
    let content = resp.candidates.into_iter().next()?.content?;
    let parts: Vec<String> = content.parts.into_iter().filter_map(|p| p.text).collect();
    if parts.is_empty() {
        return None;
    }
    Some(ParsedResponse {
        text: parts.concat(),
        usage,
    })
}

impl ResponseParser for GeminiParser {
    fn parse(&self, payload: &Value) -> ParsedResponse {
        ChatCompletion::decode(payload)
            .and_then(ChatCompletion::into_parsed)
            .or_else(|| parse_native(payload))
            .unwrap_or_else(|| degraded(Provider::Gemini, payload))
    }
}
