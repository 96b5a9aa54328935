use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AiClientError;

pub const DEFAULT_LOCAL_MODEL_URL: &str = "http://localhost:11434";
pub const DEFAULT_PROXY_URL: &str = "http://localhost:3001/api/proxy";

/// Model offered when local discovery fails, so the UI always has a choice.
pub const FALLBACK_LOCAL_MODEL: &str = "llama3";

const REDACTED: &str = "[REDACTED]";

/// LLM vendor or local runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    Qwen,
    Groq,
    Ollama,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Gemini,
        Provider::Qwen,
        Provider::Groq,
        Provider::Ollama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Qwen => "qwen",
            Self::Groq => "groq",
            Self::Ollama => "ollama",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Ollama)
    }

    /// Vendors whose direct endpoint speaks the OpenAI `/chat/completions` dialect.
    pub fn is_openai_compatible(&self) -> bool {
        matches!(self, Self::OpenAi | Self::Gemini | Self::Qwen | Self::Groq)
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("https://api.openai.com/v1"),
            Self::Anthropic => Some("https://api.anthropic.com/v1"),
            Self::Gemini => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            Self::Qwen => Some("https://dashscope.aliyuncs.com/compatible-mode/v1"),
            Self::Groq => Some("https://api.groq.com/openai/v1"),
            // Resolved from ServiceConfig::local_model_url.
            Self::Ollama => None,
        }
    }

    fn api_key_env(&self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &["OPENAI_API_KEY"],
            Self::Anthropic => &["ANTHROPIC_API_KEY"],
            Self::Gemini => &["GEMINI_API_KEY"],
            Self::Qwen => &["QWEN_API_KEY", "DASHSCOPE_API_KEY"],
            Self::Groq => &["GROQ_API_KEY"],
            Self::Ollama => &[],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = AiClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            "qwen" | "dashscope" => Ok(Self::Qwen),
            "groq" => Ok(Self::Groq),
            "ollama" | "local" => Ok(Self::Ollama),
            other => Err(AiClientError::Configuration(format!(
                "unknown provider: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for Provider {
    type Error = AiClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Provider> for String {
    fn from(p: Provider) -> Self {
        p.as_str().to_string()
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

impl ModelConfig {
    pub fn new(provider: Provider, id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            provider,
            api_key: None,
            base_url: None,
            context_window: None,
            max_output_tokens: None,
            local_path: None,
        }
    }

    fn with_limits(mut self, context_window: u32, max_output_tokens: u32) -> Self {
        self.context_window = Some(context_window);
        self.max_output_tokens = Some(max_output_tokens);
        self
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| REDACTED))
            .field("base_url", &self.base_url)
            .field("context_window", &self.context_window)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("local_path", &self.local_path)
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub models: Vec<ModelConfig>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| REDACTED))
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .finish()
    }
}

/// Fields a caller may change on a single provider.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfigUpdate {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 800,
        }
    }
}

/// Process-wide client configuration. Serialized to/from the settings blob as
/// camelCase JSON; the same shape is accepted from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub providers: BTreeMap<Provider, ProviderConfig>,
    pub default_provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    pub proxy_url: String,
    pub use_proxy: bool,
    pub local_model_enabled: bool,
    pub local_model_url: String,
    /// Reverse proxy in front of the local server. When set, chat and
    /// generate go to `{local_proxy_url}/chat` and `/generate`; discovery
    /// stays on `local_model_url`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_proxy_url: Option<String>,
    pub request_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub discovery_timeout_secs: u64,
    /// Sent where the vendor requires `max_tokens` and the caller gave none.
    pub default_max_tokens: u32,
    pub retry: RetryConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            default_provider: Provider::Ollama,
            default_model: Some(FALLBACK_LOCAL_MODEL.to_string()),
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            use_proxy: false,
            local_model_enabled: true,
            local_model_url: DEFAULT_LOCAL_MODEL_URL.to_string(),
            local_proxy_url: None,
            request_timeout_secs: 120,
            probe_timeout_secs: 3,
            discovery_timeout_secs: 5,
            default_max_tokens: 1024,
            retry: RetryConfig::default(),
        }
    }
}

/// Shallow top-level patch: every `Some` field replaces the current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfigPatch {
    pub providers: Option<BTreeMap<Provider, ProviderConfig>>,
    pub default_provider: Option<Provider>,
    pub default_model: Option<String>,
    pub proxy_url: Option<String>,
    pub use_proxy: Option<bool>,
    pub local_model_enabled: Option<bool>,
    pub local_model_url: Option<String>,
    pub local_proxy_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub discovery_timeout_secs: Option<u64>,
    pub default_max_tokens: Option<u32>,
    pub retry: Option<RetryConfig>,
}

impl ServiceConfigPatch {
    pub fn apply(self, config: &mut ServiceConfig) {
        if let Some(v) = self.providers {
            config.providers = v;
        }
        if let Some(v) = self.default_provider {
            config.default_provider = v;
        }
        if let Some(v) = self.default_model {
            config.default_model = Some(v);
        }
        if let Some(v) = self.proxy_url {
            config.proxy_url = v;
        }
        if let Some(v) = self.use_proxy {
            config.use_proxy = v;
        }
        if let Some(v) = self.local_model_enabled {
            config.local_model_enabled = v;
        }
        if let Some(v) = self.local_model_url {
            config.local_model_url = v;
        }
        if let Some(v) = self.local_proxy_url {
            config.local_proxy_url = non_blank(Some(v.as_str())).map(trim_slash);
        }
        if let Some(v) = self.request_timeout_secs {
            config.request_timeout_secs = v;
        }
        if let Some(v) = self.probe_timeout_secs {
            config.probe_timeout_secs = v;
        }
        if let Some(v) = self.discovery_timeout_secs {
            config.discovery_timeout_secs = v;
        }
        if let Some(v) = self.default_max_tokens {
            config.default_max_tokens = v;
        }
        if let Some(v) = self.retry {
            config.retry = v;
        }
    }
}

impl ServiceConfig {
    /// Defaults, then the optional TOML file, then environment overrides.
    pub fn load() -> Self {
        let mut config = match config_file_path() {
            Some(path) => match Self::from_toml_file(&path) {
                Ok(c) => {
                    tracing::info!(path = %path.display(), "loaded config file");
                    c
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "ignoring config file: {e}");
                    Self::default()
                }
            },
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.warn_missing_keys();
        config
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, AiClientError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AiClientError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Provider sections present in the file replace the bundled ones;
    /// providers the file omits keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, AiClientError> {
        let mut parsed: ServiceConfig = toml::from_str(text)
            .map_err(|e| AiClientError::Configuration(format!("invalid config TOML: {e}")))?;
        for (provider, defaults) in default_providers() {
            parsed.providers.entry(provider).or_insert(defaults);
        }
        Ok(parsed)
    }

    pub fn from_json(text: &str) -> Result<Self, AiClientError> {
        serde_json::from_str(text)
            .map_err(|e| AiClientError::Configuration(format!("invalid config JSON: {e}")))
    }

    pub fn to_json(&self) -> Result<String, AiClientError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| AiClientError::Configuration(format!("failed to serialize config: {e}")))
    }

    /// Copy with every provider and model API key masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for provider in copy.providers.values_mut() {
            if provider.api_key.is_some() {
                provider.api_key = Some(REDACTED.to_string());
            }
            for model in &mut provider.models {
                if model.api_key.is_some() {
                    model.api_key = Some(REDACTED.to_string());
                }
            }
        }
        copy
    }

    /// Local chat/generate base: the local proxy when configured.
    pub fn local_proxy(&self) -> Option<String> {
        non_blank(self.local_proxy_url.as_deref()).map(trim_slash)
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        for provider in Provider::ALL {
            if let Some(key) = provider.api_key_env().iter().find_map(|k| non_empty(*k)) {
                self.providers.entry(provider).or_default().api_key = Some(key);
            }
        }
        if let Some(url) = non_empty("OLLAMA_HOST") {
            self.local_model_url = normalize_host(&url);
        }
        if let Some(url) = non_empty("MINDWIRE_PROXY_URL") {
            self.proxy_url = url;
        }
        if let Some(url) = non_empty("MINDWIRE_LOCAL_PROXY_URL") {
            self.local_proxy_url = Some(trim_slash(&url));
        }
        if let Some(flag) = non_empty("MINDWIRE_USE_PROXY") {
            let flag = flag.trim().to_ascii_lowercase();
            self.use_proxy = matches!(flag.as_str(), "1" | "true" | "yes");
        }
    }

    fn warn_missing_keys(&self) {
        if self.use_proxy {
            return;
        }
        for provider in Provider::ALL.iter().filter(|p| !p.is_local()) {
            let has_key = self
                .providers
                .get(provider)
                .is_some_and(|c| c.api_key.is_some());
            if !has_key {
                tracing::warn!(
                    provider = %provider,
                    "no API key configured, direct calls unavailable"
                );
            }
        }
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderConfig> {
        self.providers.get(&provider)
    }

    pub fn find_model(&self, provider: Provider, model_id: &str) -> Option<&ModelConfig> {
        self.providers
            .get(&provider)
            .and_then(|c| c.models.iter().find(|m| m.id == model_id))
    }

    /// Base URL: per-request override, then the model entry, then the provider
    /// config, then the built-in default. The local server always resolves to
    /// `local_model_url` unless overridden.
    pub fn resolve_base_url(
        &self,
        provider: Provider,
        model_id: &str,
        override_url: Option<&str>,
    ) -> Option<String> {
        if let Some(url) = non_blank(override_url) {
            return Some(trim_slash(url));
        }
        if provider.is_local() {
            return non_blank(Some(self.local_model_url.as_str())).map(trim_slash);
        }
        let model_url = self
            .find_model(provider, model_id)
            .and_then(|m| m.base_url.as_deref());
        let provider_url = self
            .providers
            .get(&provider)
            .and_then(|c| c.base_url.as_deref());
        non_blank(model_url)
            .or_else(|| non_blank(provider_url))
            .or_else(|| provider.default_base_url())
            .map(trim_slash)
    }

    pub fn resolve_api_key(
        &self,
        provider: Provider,
        model_id: &str,
        override_key: Option<&str>,
    ) -> Option<String> {
        let model_key = self
            .find_model(provider, model_id)
            .and_then(|m| m.api_key.as_deref());
        let provider_key = self
            .providers
            .get(&provider)
            .and_then(|c| c.api_key.as_deref());
        non_blank(override_key)
            .or_else(|| non_blank(model_key))
            .or_else(|| non_blank(provider_key))
            .map(str::to_string)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MINDWIRE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from("mindwire.toml");
    local.exists().then_some(local)
}

/// `OLLAMA_HOST` is often given as bare `host:port`.
fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("http://") || raw.starts_with("https://") {
        trim_slash(raw)
    } else {
        format!("http://{}", trim_slash(raw))
    }
}

pub(crate) fn trim_slash(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn default_providers() -> BTreeMap<Provider, ProviderConfig> {
    let mut providers = BTreeMap::new();
    let bundled = |models: Vec<ModelConfig>| ProviderConfig {
        api_key: None,
        base_url: None,
        models,
    };

    providers.insert(
        Provider::OpenAi,
        bundled(vec![
            ModelConfig::new(Provider::OpenAi, "gpt-4o", "GPT-4o").with_limits(128_000, 16_384),
            ModelConfig::new(Provider::OpenAi, "gpt-4o-mini", "GPT-4o mini")
                .with_limits(128_000, 16_384),
        ]),
    );
    providers.insert(
        Provider::Anthropic,
        bundled(vec![
            ModelConfig::new(Provider::Anthropic, "claude-3-5-sonnet-latest", "Claude 3.5 Sonnet")
                .with_limits(200_000, 8_192),
            ModelConfig::new(Provider::Anthropic, "claude-3-5-haiku-latest", "Claude 3.5 Haiku")
                .with_limits(200_000, 8_192),
        ]),
    );
    providers.insert(
        Provider::Gemini,
        bundled(vec![
            ModelConfig::new(Provider::Gemini, "gemini-1.5-pro", "Gemini 1.5 Pro")
                .with_limits(2_000_000, 8_192),
            ModelConfig::new(Provider::Gemini, "gemini-1.5-flash", "Gemini 1.5 Flash")
                .with_limits(1_000_000, 8_192),
        ]),
    );
    providers.insert(
        Provider::Qwen,
        bundled(vec![
            ModelConfig::new(Provider::Qwen, "qwen-plus", "Qwen Plus").with_limits(131_072, 8_192),
            ModelConfig::new(Provider::Qwen, "qwen-turbo", "Qwen Turbo")
                .with_limits(1_000_000, 8_192),
        ]),
    );
    providers.insert(
        Provider::Groq,
        bundled(vec![
            ModelConfig::new(Provider::Groq, "llama-3.1-70b-versatile", "Llama 3.1 70B (Groq)")
                .with_limits(131_072, 8_192),
            ModelConfig::new(Provider::Groq, "mixtral-8x7b-32768", "Mixtral 8x7B (Groq)")
                .with_limits(32_768, 8_192),
        ]),
    );
    providers.insert(Provider::Ollama, bundled(Vec::new()));
    providers
}
