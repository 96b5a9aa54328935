use std::time::{Duration, Instant};

use reqwest::Client;

use crate::config::Provider;
use crate::dispatch::ParsedResponse;
use crate::dispatch::request::{BuiltRequest, HttpMethod, Route};
use crate::error::{AiClientError, tail_chars};
use crate::parsers;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

/// Chars of an error body kept in `Upstream` messages.
const ERROR_BODY_CHARS: usize = 1000;

/// Executes built requests. One pooled client shared by every call; timeouts
/// are per request, never global.
pub struct HttpDispatch {
    client: Client,
}

impl HttpDispatch {
    pub fn new() -> Result<Self, AiClientError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| {
                AiClientError::Configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client })
    }

    /// Send and parse. The response parser is picked from `req.provider`.
    pub async fn send(&self, req: &BuiltRequest) -> Result<ParsedResponse, AiClientError> {
        let start = Instant::now();
        let body = self.execute(req).await?;
        let parsed = parsers::parse_response(req.provider, &body)?;

        tracing::debug!(
            provider = %req.provider,
            model = req.model,
            request_id = req.request_id,
            route = ?req.route,
            latency_ms = start.elapsed().as_millis() as u64,
            "response parsed"
        );
        Ok(parsed)
    }

    /// Run the request and return the raw success body. Resolves to
    /// `Cancelled` as soon as the request's token fires.
    pub async fn execute(&self, req: &BuiltRequest) -> Result<Vec<u8>, AiClientError> {
        tokio::select! {
            biased;
            _ = req.cancellation.cancelled() => {
                tracing::info!(
                    provider = %req.provider,
                    request_id = req.request_id,
                    "request cancelled"
                );
                Err(AiClientError::Cancelled(req.request_id.clone()))
            }
            result = self.execute_inner(req) => result,
        }
    }

    async fn execute_inner(&self, req: &BuiltRequest) -> Result<Vec<u8>, AiClientError> {
        let provider = req.provider.to_string();
        let start = Instant::now();

        let mut builder = match req.method {
            HttpMethod::Get => self.client.get(&req.url),
            HttpMethod::Post => self.client.post(&req.url),
        };
        for (k, v) in &req.headers {
            builder = builder.header(k, v);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder
            .timeout(req.timeout)
            .send()
            .await
            .map_err(|e| transport_error(&provider, e, start))?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => {}
            429 => return Err(AiClientError::RateLimited { provider }),
            401 | 403 => {
                return Err(AiClientError::AuthFailed {
                    provider,
                    message: status.to_string(),
                });
            }
            404 => {
                return Err(AiClientError::ModelNotFound {
                    model: req.model.clone(),
                    hint: not_found_hint(req),
                });
            }
            code => {
                let raw = response.bytes().await.unwrap_or_default();
                let body = String::from_utf8_lossy(&raw[..raw.len().min(MAX_RESPONSE_BYTES)]);
                return Err(AiClientError::Upstream {
                    provider,
                    message: format!("{status}: {}", tail_chars(body.trim(), ERROR_BODY_CHARS)),
                    status: Some(code),
                });
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(&provider, e, start))?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(AiClientError::Upstream {
                provider,
                message: format!(
                    "response body of {} bytes exceeds the {MAX_RESPONSE_BYTES} byte cap",
                    bytes.len()
                ),
                status: None,
            });
        }

        Ok(bytes.to_vec())
    }
}

fn transport_error(provider: &str, e: reqwest::Error, start: Instant) -> AiClientError {
    if e.is_timeout() {
        return AiClientError::Timeout(start.elapsed().as_millis() as u64);
    }
    AiClientError::Transport {
        provider: provider.to_string(),
        message: e.to_string(),
    }
}

fn not_found_hint(req: &BuiltRequest) -> String {
    match (req.provider, req.route) {
        (Provider::Ollama, Route::Proxy) => format!(
            "the proxy could not find '{}'; install it with `ollama pull {}`",
            req.model, req.model
        ),
        (Provider::Ollama, _) => format!(
            "install the model with `ollama pull {}` or pick an installed one",
            req.model
        ),
        (provider, _) => format!("check that '{}' is a valid {provider} model id", req.model),
    }
}
