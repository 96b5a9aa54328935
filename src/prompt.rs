//! Flattens a role-tagged conversation into the single prompt string that
//! completion-style ("generate") endpoints expect.
//!
//! The template is picked from [`FAMILY_RULES`], an ordered table of model-id
//! substrings. First match wins, so more specific patterns (`llama3`) sit
//! above broader ones (`llama2`). Unknown models get the generic
//! `Role: content` layout.

use crate::dispatch::{Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTemplate {
    /// `<|start_header_id|>role<|end_header_id|>` headers.
    Llama3,
    /// ChatML `<|im_start|>role` blocks (Qwen, Yi, Hermes, Dolphin).
    ChatMl,
    /// `<start_of_turn>user|model`, no system role.
    Gemma,
    /// `<|system|>`, `<|user|>`, `<|assistant|>` tags.
    Phi3,
    /// `[INST] ... [/INST]` pairs with a `<<SYS>>` block (Llama 2, Mistral).
    Inst,
    Generic,
}

pub struct FamilyRule {
    pub patterns: &'static [&'static str],
    pub template: PromptTemplate,
}

pub const FAMILY_RULES: &[FamilyRule] = &[
    FamilyRule {
        patterns: &["llama3", "llama-3", "llama 3"],
        template: PromptTemplate::Llama3,
    },
    FamilyRule {
        patterns: &["qwen", "yi:", "yi-", "openhermes", "nous-hermes", "dolphin", "chatml"],
        template: PromptTemplate::ChatMl,
    },
    FamilyRule {
        patterns: &["gemma"],
        template: PromptTemplate::Gemma,
    },
    FamilyRule {
        patterns: &["phi3", "phi-3", "phi4", "phi-4"],
        template: PromptTemplate::Phi3,
    },
    FamilyRule {
        patterns: &["mistral", "mixtral", "llama2", "llama-2", "codellama"],
        template: PromptTemplate::Inst,
    },
];

/// Model-id fragments of instruction-tuned families that behave better on the
/// structured chat endpoint.
pub const CHAT_PREFERRING_MODELS: &[&str] = &[
    "llama3", "llama-3", "qwen", "mistral", "mixtral", "gemma", "phi3", "phi-3", "deepseek",
    "command-r", "chat", "instruct",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEndpoint {
    Chat,
    Generate,
}

impl LocalEndpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Generate => "generate",
        }
    }
}

pub fn template_for(model_id: &str) -> PromptTemplate {
    let id = model_id.to_lowercase();
    FAMILY_RULES
        .iter()
        .find(|rule| rule.patterns.iter().any(|p| id.contains(p)))
        .map(|rule| rule.template)
        .unwrap_or(PromptTemplate::Generic)
}

/// Chat when the conversation has prior assistant turns, carries a system
/// message, or targets a chat-preferring family. Any signal is enough.
pub fn preferred_endpoint(messages: &[Message], model_id: &str) -> LocalEndpoint {
    let id = model_id.to_lowercase();
    let multi_turn =
        messages.len() >= 2 && messages.iter().any(|m| m.role == Role::Assistant);
    let chat_family = CHAT_PREFERRING_MODELS.iter().any(|p| id.contains(p));
    let has_system = messages.iter().any(|m| m.role == Role::System);

    if multi_turn || chat_family || has_system {
        LocalEndpoint::Chat
    } else {
        LocalEndpoint::Generate
    }
}

pub fn format_prompt(messages: &[Message], model_id: &str) -> String {
    let conv = || Conversation::from_messages(messages);
    match template_for(model_id) {
        PromptTemplate::Llama3 => format_llama3(&conv()),
        PromptTemplate::ChatMl => format_chatml(&conv()),
        PromptTemplate::Gemma => format_gemma(&conv()),
        PromptTemplate::Phi3 => format_phi3(&conv()),
        PromptTemplate::Inst => format_inst(&conv()),
        PromptTemplate::Generic => format_generic(messages),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Speaker {
    User,
    Assistant,
}

/// System text merged once; remaining turns with adjacent same-speaker
/// messages joined so user and assistant alternate.
struct Conversation {
    system: Option<String>,
    turns: Vec<(Speaker, String)>,
}

impl Conversation {
    fn from_messages(messages: &[Message]) -> Self {
        let system_parts: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.trim())
            .filter(|c| !c.is_empty())
            .collect();
        let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));

        let mut turns: Vec<(Speaker, String)> = Vec::new();
        for m in messages.iter().filter(|m| m.role != Role::System) {
            let (speaker, content) = match m.role {
                Role::Assistant => (Speaker::Assistant, m.content.trim().to_string()),
                Role::Function => (Speaker::User, function_result(m)),
                _ => (Speaker::User, m.content.trim().to_string()),
            };
            match turns.last_mut() {
                Some((last, text)) if *last == speaker => {
                    text.push_str("\n\n");
                    text.push_str(&content);
                }
                _ => turns.push((speaker, content)),
            }
        }

        Self { system, turns }
    }
}

fn function_result(m: &Message) -> String {
    match &m.name {
        Some(name) => format!("[{name} result]\n{}", m.content.trim()),
        None => format!("[function result]\n{}", m.content.trim()),
    }
}

fn format_llama3(conv: &Conversation) -> String {
    let mut out = String::from("<|begin_of_text|>");
    let mut block = |role: &str, content: &str| {
        out.push_str(&format!(
            "<|start_header_id|>{role}<|end_header_id|>\n\n{content}<|eot_id|>"
        ));
    };
    if let Some(sys) = &conv.system {
        block("system", sys);
    }
    for (speaker, content) in &conv.turns {
        match speaker {
            Speaker::User => block("user", content),
            Speaker::Assistant => block("assistant", content),
        }
    }
    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    out
}

fn format_chatml(conv: &Conversation) -> String {
    let mut out = String::new();
    if let Some(sys) = &conv.system {
        out.push_str(&format!("<|im_start|>system\n{sys}<|im_end|>\n"));
    }
    for (speaker, content) in &conv.turns {
        let role = match speaker {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        };
        out.push_str(&format!("<|im_start|>{role}\n{content}<|im_end|>\n"));
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

fn format_gemma(conv: &Conversation) -> String {
    let mut out = String::new();
    // Gemma has no system turn: fold it into the first user turn.
    let mut pending_system = conv.system.clone();
    for (speaker, content) in &conv.turns {
        match speaker {
            Speaker::User => {
                let body = match pending_system.take() {
                    Some(sys) => format!("{sys}\n\n{content}"),
                    None => content.clone(),
                };
                out.push_str(&format!("<start_of_turn>user\n{body}<end_of_turn>\n"));
            }
            Speaker::Assistant => {
                out.push_str(&format!("<start_of_turn>model\n{content}<end_of_turn>\n"));
            }
        }
    }
    if let Some(sys) = pending_system {
        out.push_str(&format!("<start_of_turn>user\n{sys}<end_of_turn>\n"));
    }
    out.push_str("<start_of_turn>model\n");
    out
}

fn format_phi3(conv: &Conversation) -> String {
    let mut out = String::new();
    if let Some(sys) = &conv.system {
        out.push_str(&format!("<|system|>\n{sys}<|end|>\n"));
    }
    for (speaker, content) in &conv.turns {
        let tag = match speaker {
            Speaker::User => "<|user|>",
            Speaker::Assistant => "<|assistant|>",
        };
        out.push_str(&format!("{tag}\n{content}<|end|>\n"));
    }
    out.push_str("<|assistant|>\n");
    out
}

/// Each user turn opens `[INST]` and is closed by ` [/INST]`, which is also
/// the open assistant marker. A trailing assistant turn is closed and followed
/// by an empty instruction so the output still ends on the marker.
fn format_inst(conv: &Conversation) -> String {
    let mut out = String::from("<s>");
    let mut pending_system = conv.system.clone();
    let mut open_instruction = false;

    for (speaker, content) in &conv.turns {
        match speaker {
            Speaker::User => {
                open_inst(&mut out, content, &mut pending_system);
                open_instruction = true;
            }
            Speaker::Assistant => {
                if !open_instruction {
                    open_inst(&mut out, "", &mut pending_system);
                }
                out.push_str(&format!(" {content}</s><s>"));
                open_instruction = false;
            }
        }
    }
    if !open_instruction {
        open_inst(&mut out, "", &mut pending_system);
    }
    out
}

fn open_inst(out: &mut String, user: &str, pending_system: &mut Option<String>) {
    out.push_str("[INST] ");
    if let Some(sys) = pending_system.take() {
        out.push_str(&format!("<<SYS>>\n{sys}\n<</SYS>>\n\n"));
    }
    out.push_str(user);
    out.push_str(" [/INST]");
}

fn format_generic(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        let label = match (m.role, &m.name) {
            (Role::System, _) => "System".to_string(),
            (Role::User, _) => "User".to_string(),
            (Role::Assistant, _) => "Assistant".to_string(),
            (Role::Function, Some(name)) => format!("Function ({name})"),
            (Role::Function, None) => "Function".to_string(),
        };
        out.push_str(&format!("{label}: {}\n\n", m.content));
    }
    out.push_str("Assistant:");
    out
}
