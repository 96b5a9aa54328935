//! Caller-facing client: one `send_request` for every provider.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::{
    FALLBACK_LOCAL_MODEL, ModelConfig, Provider, ProviderConfigUpdate, ServiceConfig,
    ServiceConfigPatch,
};
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::lifecycle::RequestLifecycle;
use crate::dispatch::registry::ProviderCatalog;
use crate::dispatch::request::{RequestBuilder, tags_request};
use crate::dispatch::retry::{
    RetryOrchestrator, RetryPolicy, Sleeper, Strategy, TokioSleeper, strategy_order,
};
use crate::dispatch::{AiRequestParams, AiResponse, Message, ParsedResponse};
use crate::error::AiClientError;
use crate::prompt::{self, LocalEndpoint};

const CONNECTION_TEST_PROMPT: &str = "Hi";

pub struct AiClient {
    catalog: ProviderCatalog,
    http: Arc<HttpDispatch>,
    lifecycle: RequestLifecycle,
    sleeper: Arc<dyn Sleeper>,
}

impl AiClient {
    pub fn new(config: ServiceConfig) -> Result<Self, AiClientError> {
        Self::with_sleeper(config, Arc::new(TokioSleeper))
    }

    /// Same as [`AiClient::new`] with a custom backoff sleeper.
    pub fn with_sleeper(
        config: ServiceConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, AiClientError> {
        Ok(Self {
            catalog: ProviderCatalog::new(config),
            http: Arc::new(HttpDispatch::new()?),
            lifecycle: RequestLifecycle::new(),
            sleeper,
        })
    }

    /// Send one request and wait for the complete response.
    ///
    /// Cloud providers get a single attempt. The local model server goes
    /// through the strategy orchestrator. The request is cancellable via
    /// [`AiClient::cancel_request`] until it returns, and its id is released
    /// on every exit path.
    pub async fn send_request(&self, params: AiRequestParams) -> Result<AiResponse, AiClientError> {
        params.validate()?;
        let lease = self.lifecycle.lease(params.request_id.as_deref())?;
        let config = self.catalog.snapshot();
        let start = Instant::now();

        tracing::info!(
            request_id = lease.id(),
            provider = %params.provider,
            model = params.model,
            messages = params.messages.len(),
            use_proxy = config.use_proxy,
            "sending request"
        );

        let result = if params.provider.is_local() {
            self.send_local(&config, &params, lease.id(), lease.token())
                .await
        } else {
            self.send_cloud(&config, &params, lease.id(), lease.token())
                .await
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(parsed) => {
                tracing::info!(
                    request_id = lease.id(),
                    provider = %params.provider,
                    latency_ms,
                    chars = parsed.text.len(),
                    "request completed"
                );
                Ok(AiResponse {
                    text: parsed.text,
                    request_id: lease.id().to_string(),
                    usage: parsed.usage,
                })
            }
            Err(e) => {
                tracing::warn!(
                    request_id = lease.id(),
                    provider = %params.provider,
                    latency_ms,
                    kind = ?e.kind(),
                    "request failed: {e}"
                );
                Err(e)
            }
        }
    }

    async fn send_cloud(
        &self,
        config: &ServiceConfig,
        params: &AiRequestParams,
        request_id: &str,
        cancellation: &CancellationToken,
    ) -> Result<ParsedResponse, AiClientError> {
        let req = RequestBuilder::new(config, request_id, cancellation).build(params)?;
        self.http.send(&req).await
    }

    async fn send_local(
        &self,
        config: &ServiceConfig,
        params: &AiRequestParams,
        request_id: &str,
        cancellation: &CancellationToken,
    ) -> Result<ParsedResponse, AiClientError> {
        if !config.local_model_enabled {
            return Err(AiClientError::Configuration(
                "local model server is disabled".into(),
            ));
        }
        self.spawn_probe(config, request_id);

        let preferred = prompt::preferred_endpoint(&params.messages, &params.model);
        let orchestrator =
            RetryOrchestrator::new(RetryPolicy::from(&config.retry), Arc::clone(&self.sleeper));
        let builder = RequestBuilder::new(config, request_id, cancellation);
        let http = &self.http;

        orchestrator
            .run(
                strategy_order(preferred),
                request_id,
                cancellation,
                |strategy, _attempt| {
                    let built = match strategy {
                        Strategy::ChatApi => builder.build_local(params, LocalEndpoint::Chat),
                        Strategy::GenerateApi => {
                            builder.build_local(params, LocalEndpoint::Generate)
                        }
                        Strategy::Generic => builder.build_routed(params),
                    };
                    async move { http.send(&built?).await }
                },
            )
            .await
    }

    /// Fire-and-forget reachability check of the local server. Only logs.
    fn spawn_probe(&self, config: &ServiceConfig, request_id: &str) {
        let req = match tags_request(config, Duration::from_secs(config.probe_timeout_secs)) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(request_id, "local model probe skipped: {e}");
                return;
            }
        };
        let http = Arc::clone(&self.http);
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            match http.execute(&req).await {
                Ok(_) => {
                    tracing::debug!(request_id, url = req.url, "local model server reachable")
                }
                Err(e) => tracing::warn!(
                    request_id,
                    url = req.url,
                    "local model server probe failed: {e}"
                ),
            }
        });
    }

    /// Cancel an in-flight request. Returns whether the id was in flight.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        self.lifecycle.cancel(request_id)
    }

    pub fn in_flight(&self) -> Vec<String> {
        self.lifecycle.in_flight()
    }

    /// Send a one-token prompt and report whether any text came back. A single
    /// attempt, even for the local server. Failures are logged, not returned.
    pub async fn test_connection(
        &self,
        provider: Provider,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> bool {
        let config = self.catalog.snapshot();
        if provider.is_local() && !config.local_model_enabled {
            tracing::warn!(
                provider = %provider,
                "connection test skipped: local model server is disabled"
            );
            return false;
        }
        let model = probe_model(&config, provider);
        let mut params = AiRequestParams::new(
            provider,
            &model,
            vec![Message::user(CONNECTION_TEST_PROMPT)],
        );
        params.max_tokens = Some(1);
        params.api_key = api_key;
        params.base_url = base_url;

        let lease = match self.lifecycle.lease(None) {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(provider = %provider, "connection test not started: {e}");
                return false;
            }
        };
        let built = match RequestBuilder::new(&config, lease.id(), lease.token()).build(&params) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(provider = %provider, "connection test failed: {e}");
                return false;
            }
        };

        match self.http.send(&built).await {
            Ok(parsed) if !parsed.text.trim().is_empty() => {
                tracing::info!(provider = %provider, model, "connection test succeeded");
                true
            }
            Ok(_) => {
                tracing::warn!(provider = %provider, model, "connection test returned no text");
                false
            }
            Err(e) => {
                tracing::warn!(provider = %provider, model, "connection test failed: {e}");
                false
            }
        }
    }

    /// Configured cloud models plus discovered local models. Never fails.
    pub async fn get_available_models(&self) -> Vec<ModelConfig> {
        self.catalog.list_available_models(&self.http).await
    }

    pub fn update_config(&self, patch: ServiceConfigPatch) {
        self.catalog.update_config(patch);
    }

    pub fn update_provider_config(&self, provider: Provider, update: ProviderConfigUpdate) {
        self.catalog.update_provider_config(provider, update);
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ServiceConfig {
        self.catalog.snapshot()
    }
}

/// Model used for a connection test: the provider's first configured model,
/// else the default model when the provider is the default one.
fn probe_model(config: &ServiceConfig, provider: Provider) -> String {
    if let Some(first) = config.provider(provider).and_then(|p| p.models.first()) {
        return first.id.clone();
    }
    match &config.default_model {
        Some(model) if config.default_provider == provider => model.clone(),
        _ if provider.is_local() => FALLBACK_LOCAL_MODEL.to_string(),
        _ => provider.as_str().to_string(),
    }
}
