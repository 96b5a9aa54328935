use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::{Provider, ServiceConfig};
use crate::dispatch::{AiRequestParams, Message, Role};
use crate::error::AiClientError;
use crate::prompt::{self, LocalEndpoint, PromptTemplate};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Where a built request goes. Used for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxy,
    Local(LocalEndpoint),
    Discovery,
}

/// Transport-level request: everything the HTTP layer needs, nothing more.
#[derive(Clone)]
pub struct BuiltRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Selects the response parser.
    pub provider: Provider,
    pub model: String,
    pub route: Route,
    pub request_id: String,
    pub timeout: Duration,
    pub cancellation: CancellationToken,
}

const SECRET_HEADERS: &[&str] = &["authorization", "x-api-key", "x-goog-api-key"];

impl fmt::Debug for BuiltRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(k, v)| {
                if SECRET_HEADERS.contains(&k.to_ascii_lowercase().as_str()) {
                    (k.as_str(), "[REDACTED]")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("BuiltRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &headers)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("route", &self.route)
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl BuiltRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Builds one transport request from caller parameters and a config snapshot.
pub struct RequestBuilder<'a> {
    config: &'a ServiceConfig,
    request_id: &'a str,
    cancellation: &'a CancellationToken,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(
        config: &'a ServiceConfig,
        request_id: &'a str,
        cancellation: &'a CancellationToken,
    ) -> Self {
        Self {
            config,
            request_id,
            cancellation,
        }
    }

    /// Local server: chat or generate by heuristic. Otherwise proxy or direct.
    pub fn build(&self, params: &AiRequestParams) -> Result<BuiltRequest, AiClientError> {
        if params.provider.is_local() {
            let endpoint = prompt::preferred_endpoint(&params.messages, &params.model);
            return self.build_local(params, endpoint);
        }
        self.build_routed(params)
    }

    /// Native local-server call on an explicit endpoint. Always non-streaming.
    pub fn build_local(
        &self,
        params: &AiRequestParams,
        endpoint: LocalEndpoint,
    ) -> Result<BuiltRequest, AiClientError> {
        let url = self.local_url(params, endpoint)?;
        let options = local_options(params);

        let body = match endpoint {
            LocalEndpoint::Chat => {
                let messages: Vec<Value> = params.messages.iter().map(local_chat_message).collect();
                json!({
                    "model": params.model,
                    "messages": messages,
                    "options": options,
                    "stream": false,
                })
            }
            LocalEndpoint::Generate => {
                let prompt = prompt::format_prompt(&params.messages, &params.model);
                // A family template already carries the model's markup; stop the
                // server from wrapping it a second time.
                let raw = prompt::template_for(&params.model) != PromptTemplate::Generic;
                json!({
                    "model": params.model,
                    "prompt": prompt,
                    "raw": raw,
                    "options": options,
                    "stream": false,
                })
            }
        };

        Ok(self.post(params, url, json_headers(), body, Route::Local(endpoint)))
    }

    /// Proxy when enabled, otherwise the vendor-native endpoint. For the local
    /// server the direct form is `/api/generate` with a flattened prompt.
    pub fn build_routed(&self, params: &AiRequestParams) -> Result<BuiltRequest, AiClientError> {
        if self.config.use_proxy {
            self.build_proxy(params)
        } else {
            self.build_direct(params)
        }
    }

    fn build_proxy(&self, params: &AiRequestParams) -> Result<BuiltRequest, AiClientError> {
        let proxy = self.config.proxy_url.trim().trim_end_matches('/');
        if proxy.is_empty() {
            return Err(AiClientError::Configuration(
                "proxy is enabled but no proxy URL is configured".into(),
            ));
        }
        let provider = params.provider;
        let api_key = self
            .config
            .resolve_api_key(provider, &params.model, params.api_key.as_deref());
        let endpoint = self
            .config
            .resolve_base_url(provider, &params.model, params.base_url.as_deref());

        let body = json!({
            "model": params.model,
            "messages": params.messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": params.stream,
            "requestId": self.request_id,
            "apiKey": api_key,
            "apiEndpoint": endpoint,
        });

        Ok(self.post(
            params,
            format!("{proxy}/{provider}"),
            json_headers(),
            body,
            Route::Proxy,
        ))
    }

    fn build_direct(&self, params: &AiRequestParams) -> Result<BuiltRequest, AiClientError> {
        let provider = params.provider;
        if provider.is_local() {
            return self.build_local(params, LocalEndpoint::Generate).map(|mut req| {
                req.route = Route::Direct;
                req
            });
        }

        let base = self
            .config
            .resolve_base_url(provider, &params.model, params.base_url.as_deref())
            .ok_or_else(|| {
                AiClientError::Configuration(format!("no base URL configured for {provider}"))
            })?;
        let api_key = self
            .config
            .resolve_api_key(provider, &params.model, params.api_key.as_deref())
            .ok_or_else(|| {
                AiClientError::Configuration(format!(
                    "no API key configured for {provider} and proxy is disabled"
                ))
            })?;

        match provider {
            Provider::Anthropic => {
                let mut headers = json_headers();
                headers.push(("x-api-key".into(), api_key));
                headers.push(("anthropic-version".into(), ANTHROPIC_VERSION.into()));
                Ok(self.post(
                    params,
                    format!("{base}/messages"),
                    headers,
                    self.anthropic_body(params),
                    Route::Direct,
                ))
            }
            p if p.is_openai_compatible() => {
                let mut headers = json_headers();
                headers.push(("Authorization".into(), format!("Bearer {api_key}")));
                Ok(self.post(
                    params,
                    format!("{base}/chat/completions"),
                    headers,
                    openai_body(params),
                    Route::Direct,
                ))
            }
            other => Err(AiClientError::Configuration(format!(
                "direct calls are not supported for {other}"
            ))),
        }
    }

    fn anthropic_body(&self, params: &AiRequestParams) -> Value {
        let system: Vec<&str> = params
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<Value> = params
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = if m.role == Role::Assistant { "assistant" } else { "user" };
                json!({"role": role, "content": m.content})
            })
            .collect();

        let mut body = Map::new();
        body.insert("model".into(), json!(params.model));
        body.insert(
            "max_tokens".into(),
            json!(params.max_tokens.unwrap_or(self.config.default_max_tokens)),
        );
        body.insert("messages".into(), Value::Array(messages));
        if !system.is_empty() {
            body.insert("system".into(), json!(system.join("\n\n")));
        }
        if let Some(t) = params.temperature {
            body.insert("temperature".into(), json!(t));
        }
        Value::Object(body)
    }

    /// A per-request base URL talks to the server natively. Otherwise the
    /// local proxy takes `/chat` and `/generate` when one is configured.
    fn local_url(
        &self,
        params: &AiRequestParams,
        endpoint: LocalEndpoint,
    ) -> Result<String, AiClientError> {
        let overridden = params.base_url.as_deref().is_some_and(|u| !u.trim().is_empty());
        if !overridden && let Some(proxy) = self.config.local_proxy() {
            return Ok(format!("{proxy}/{}", endpoint.as_str()));
        }
        let base = self
            .config
            .resolve_base_url(Provider::Ollama, &params.model, params.base_url.as_deref())
            .ok_or_else(|| {
                AiClientError::Configuration("no local model server URL configured".into())
            })?;
        Ok(format!("{base}/api/{}", endpoint.as_str()))
    }

    fn post(
        &self,
        params: &AiRequestParams,
        url: String,
        headers: Vec<(String, String)>,
        body: Value,
        route: Route,
    ) -> BuiltRequest {
        BuiltRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(body),
            provider: params.provider,
            model: params.model.clone(),
            route,
            request_id: self.request_id.to_string(),
            timeout: Duration::from_secs(self.config.request_timeout_secs),
            cancellation: self.cancellation.clone(),
        }
    }
}

/// `GET {local}/api/tags`: model discovery and the connectivity probe.
pub fn tags_request(
    config: &ServiceConfig,
    timeout: Duration,
) -> Result<BuiltRequest, AiClientError> {
    let base = config
        .resolve_base_url(Provider::Ollama, "", None)
        .ok_or_else(|| {
            AiClientError::Configuration("no local model server URL configured".into())
        })?;
    Ok(BuiltRequest {
        method: HttpMethod::Get,
        url: format!("{base}/api/tags"),
        headers: Vec::new(),
        body: None,
        provider: Provider::Ollama,
        model: String::new(),
        route: Route::Discovery,
        request_id: "discovery".to_string(),
        timeout,
        cancellation: CancellationToken::new(),
    })
}

fn json_headers() -> Vec<(String, String)> {
    vec![("Content-Type".to_string(), "application/json".to_string())]
}

fn local_options(params: &AiRequestParams) -> Value {
    let mut options = Map::new();
    if let Some(t) = params.temperature {
        options.insert("temperature".into(), json!(t));
    }
    if let Some(n) = params.max_tokens {
        options.insert("num_predict".into(), json!(n));
    }
    Value::Object(options)
}

fn local_chat_message(m: &Message) -> Value {
    let role = match m.role {
        Role::Function => "tool",
        other => other.as_str(),
    };
    json!({"role": role, "content": m.content})
}

fn openai_body(params: &AiRequestParams) -> Value {
    let messages: Vec<Value> = params
        .messages
        .iter()
        .map(|m| match (m.role, &m.name) {
            (Role::Function, Some(name)) => {
                json!({"role": "function", "name": name, "content": m.content})
            }
            (Role::Function, None) => json!({"role": "user", "content": m.content}),
            (role, _) => json!({"role": role.as_str(), "content": m.content}),
        })
        .collect();

    let mut body = Map::new();
    body.insert("model".into(), json!(params.model));
    body.insert("messages".into(), Value::Array(messages));
    body.insert("stream".into(), json!(false));
    if let Some(t) = params.temperature {
        body.insert("temperature".into(), json!(t));
    }
    if let Some(n) = params.max_tokens {
        body.insert("max_tokens".into(), json!(n));
    }
    Value::Object(body)
}
