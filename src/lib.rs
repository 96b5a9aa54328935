//! Provider-agnostic language-model client.
//!
//! [`client::AiClient`] fronts cloud vendors (OpenAI-compatible, Anthropic,
//! Gemini, Qwen, Groq) and a local Ollama server behind one request and
//! response shape.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod parsers;
pub mod prompt;
