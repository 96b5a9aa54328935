//! Extracts text from stream-shaped payloads: a JSON array of fragments or a
//! newline-delimited body that arrived even though streaming was off.

use serde_json::Value;

use crate::dispatch::{ParsedResponse, Usage};

/// Does this payload look like a fragment stream rather than one object?
pub fn looks_like_stream(payload: &Value) -> bool {
    match payload {
        Value::Array(_) => true,
        Value::String(s) => {
            let trimmed = s.trim_start();
            trimmed.starts_with('{') && s.lines().filter(|l| !l.trim().is_empty()).count() > 1
        }
        _ => false,
    }
}

/// Flatten a payload into fragments. String input is split on newlines and
/// each line parsed as JSON; lines that are not JSON become raw-text fragments.
pub fn normalize_fragments(payload: &Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items
            .iter()
            .flat_map(|item| match item {
                Value::String(s) => split_lines(s),
                other => vec![other.clone()],
            })
            .collect(),
        Value::String(s) => split_lines(s),
        other => vec![other.clone()],
    }
}

fn split_lines(s: &str) -> Vec<Value> {
    s.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            serde_json::from_str::<Value>(line)
                .unwrap_or_else(|_| serde_json::json!({ "text": line }))
        })
        .collect()
}

/// First recognized text field of one fragment.
fn fragment_text(fragment: &Value) -> Option<&str> {
    let choice = &fragment["choices"][0];
    [
        &fragment["response"],
        &fragment["content"],
        &fragment["message"]["content"],
        &fragment["text"],
        &choice["text"],
        &choice["message"]["content"],
    ]
    .into_iter()
    .find_map(Value::as_str)
}

/// Concatenate fragment texts in order and sum `prompt_eval_count` /
/// `eval_count`. Fragments with no recognized field are skipped. Returns
/// `None` when no fragment contributed any text field.
pub fn extract(payload: &Value) -> Option<ParsedResponse> {
    let mut text = String::new();
    let mut matched = false;
    let mut prompt_tokens: Option<u64> = None;
    let mut completion_tokens: Option<u64> = None;

    for fragment in normalize_fragments(payload) {
        if let Some(t) = fragment_text(&fragment) {
            text.push_str(t);
            matched = true;
        }
        if let Some(n) = fragment["prompt_eval_count"].as_u64() {
            let sum = prompt_tokens.get_or_insert(0);
            *sum = sum.saturating_add(n);
        }
        if let Some(n) = fragment["eval_count"].as_u64() {
            let sum = completion_tokens.get_or_insert(0);
            *sum = sum.saturating_add(n);
        }
    }

    if !matched {
        return None;
    }

    let usage = (prompt_tokens.is_some() || completion_tokens.is_some()).then(|| {
        Usage::new(prompt_tokens.unwrap_or(0), completion_tokens.unwrap_or(0))
    });
    Some(ParsedResponse { text, usage })
}
