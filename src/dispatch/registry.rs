use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Deserialize;

use crate::config::{
    FALLBACK_LOCAL_MODEL, ModelConfig, Provider, ProviderConfigUpdate, ServiceConfig,
    ServiceConfigPatch,
};
use crate::dispatch::http::HttpDispatch;
use crate::dispatch::request::tags_request;
use crate::error::AiClientError;

/// `GET /api/tags` response from the local model server.
#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<LocalTag>,
}

#[derive(Debug, Deserialize)]
struct LocalTag {
    name: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    details: Option<TagDetails>,
}

#[derive(Debug, Deserialize)]
struct TagDetails {
    #[serde(default)]
    parameter_size: Option<String>,
}

impl LocalTag {
    fn into_model_config(self) -> ModelConfig {
        let display = match self.details.and_then(|d| d.parameter_size) {
            Some(size) if !size.trim().is_empty() => format!("{} ({size})", self.name),
            _ => self.name.clone(),
        };
        let mut model = ModelConfig::new(Provider::Ollama, &self.name, &display);
        model.local_path = Some(self.model.unwrap_or_else(|| self.name.clone()));
        model
    }
}

/// Owns the mutable service configuration and answers "which models exist".
///
/// Callers work on snapshots: a request reads the config once at the start
/// and is unaffected by updates that land while it is in flight.
pub struct ProviderCatalog {
    config: RwLock<ServiceConfig>,
}

impl ProviderCatalog {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ServiceConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServiceConfig> {
        self.config.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ServiceConfig {
        self.read().clone()
    }

    /// Shallow top-level merge.
    pub fn update_config(&self, patch: ServiceConfigPatch) {
        let mut config = self.write();
        patch.apply(&mut config);
        tracing::info!(
            default_provider = %config.default_provider,
            use_proxy = config.use_proxy,
            local_model_enabled = config.local_model_enabled,
            "service config updated"
        );
    }

    /// Merge credentials into one provider's entry, creating it if absent.
    pub fn update_provider_config(&self, provider: Provider, update: ProviderConfigUpdate) {
        let mut config = self.write();
        let entry = config.providers.entry(provider).or_default();
        if let Some(key) = update.api_key {
            entry.api_key = Some(key);
        }
        if let Some(url) = update.base_url {
            entry.base_url = Some(url);
        }
        tracing::info!(
            provider = %provider,
            has_key = entry.api_key.is_some(),
            base_url = entry.base_url.as_deref().unwrap_or("<default>"),
            "provider config updated"
        );
    }

    /// Models declared in config for every provider, in provider order.
    pub fn configured_models(&self) -> Vec<ModelConfig> {
        declared_models(&self.read())
    }

    /// Configured models plus whatever the local server reports. Discovery
    /// failure is logged and replaced by a single default local entry.
    pub async fn list_available_models(&self, http: &HttpDispatch) -> Vec<ModelConfig> {
        let config = self.snapshot();
        let mut models = declared_models(&config);

        if !config.local_model_enabled {
            tracing::debug!("local model server disabled, skipping discovery");
            return models;
        }

        let discovered = match discover_local_models(&config, http).await {
            Ok(found) if !found.is_empty() => found,
            Ok(_) => {
                tracing::warn!(
                    url = config.local_model_url,
                    "local model server reports no models, using fallback entry"
                );
                vec![fallback_local_model()]
            }
            Err(e) => {
                tracing::warn!(
                    url = config.local_model_url,
                    "local model discovery failed, using fallback entry: {e}"
                );
                vec![fallback_local_model()]
            }
        };

        for model in discovered {
            let duplicate = models
                .iter()
                .any(|m| m.provider == model.provider && m.id == model.id);
            if !duplicate {
                models.push(model);
            }
        }
        models
    }
}

fn declared_models(config: &ServiceConfig) -> Vec<ModelConfig> {
    config
        .providers
        .values()
        .flat_map(|p| p.models.iter().cloned())
        .collect()
}

async fn discover_local_models(
    config: &ServiceConfig,
    http: &HttpDispatch,
) -> Result<Vec<ModelConfig>, AiClientError> {
    let req = tags_request(config, Duration::from_secs(config.discovery_timeout_secs))?;
    let body = http.execute(&req).await?;
    let tags: TagsResponse =
        serde_json::from_slice(&body).map_err(|e| AiClientError::Upstream {
            provider: Provider::Ollama.to_string(),
            message: format!("unreadable model list: {e}"),
            status: None,
        })?;
    let models: Vec<ModelConfig> = tags
        .models
        .into_iter()
        .filter(|t| !t.name.trim().is_empty())
        .map(LocalTag::into_model_config)
        .collect();
    tracing::debug!(count = models.len(), "discovered local models");
    Ok(models)
}

fn fallback_local_model() -> ModelConfig {
    let mut model = ModelConfig::new(Provider::Ollama, FALLBACK_LOCAL_MODEL, "Llama 3 (default)");
    model.local_path = Some(FALLBACK_LOCAL_MODEL.to_string());
    model
}
