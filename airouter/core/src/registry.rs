//! Provider Registry
//!
//! Immutable snapshot of the configured providers and their models, plus the
//! one runtime-mutable field: the manual `enabled` switch. Every other
//! component receives a [`RegistryHandle`] at construction time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::routing::config::{ProviderConfig, ProviderKind, ProviderTier};

/// Shared handle to the registry
pub type RegistryHandle = Arc<ProviderRegistry>;

/// Registry lookup errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No provider with this id
    #[error("Provider not found: {0}")]
    NotFound(String),
}

/// A model served by a provider
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Model {
    /// Identifier sent upstream
    pub id: String,
    /// Display name
    pub name: String,
    /// Context window in tokens, when known
    pub context_window: Option<u32>,
    /// Capabilities such as "vision"
    pub capabilities: Vec<String>,
    /// Whether this is the provider's default model
    pub is_default: bool,
}

/// A backend capable of serving chat completions
///
/// Everything except `enabled` is fixed at startup; `enabled` lives in the
/// registry's side table.
#[derive(Clone, Debug, Serialize)]
pub struct Provider {
    /// Stable identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Lower is tried first
    pub priority: u32,
    /// In-flight capacity
    pub max_concurrent: u32,
    /// Local machine or cloud API
    pub tier: ProviderTier,
    /// Wire protocol
    pub kind: ProviderKind,
    /// Base URL
    pub base_url: String,
    /// Health probe path
    pub health_path: String,
    /// Environment variable holding the bearer key
    #[serde(skip)]
    pub api_key_env: Option<String>,
    /// Served models; exactly one has `is_default = true`
    pub models: Vec<Model>,
}

impl Provider {
    /// Build a provider from validated configuration
    ///
    /// When no model is marked default, the first one becomes the default.
    #[must_use]
    pub fn from_config(config: &ProviderConfig) -> Self {
        let has_default = config.models.iter().any(|m| m.is_default);
        let models = config
            .models
            .iter()
            .enumerate()
            .map(|(i, m)| Model {
                id: m.id.clone(),
                name: m.name.clone().unwrap_or_else(|| m.id.clone()),
                context_window: m.context_window,
                capabilities: m.capabilities.clone(),
                is_default: if has_default { m.is_default } else { i == 0 },
            })
            .collect();

        Self {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| config.id.clone()),
            priority: config.priority,
            max_concurrent: config.max_concurrent.max(1),
            tier: config.tier,
            kind: config.kind,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            health_path: config.health_path().to_string(),
            api_key_env: config.api_key_env.clone(),
            models,
        }
    }

    /// The default model
    #[must_use]
    pub fn default_model(&self) -> Option<&Model> {
        self.models
            .iter()
            .find(|m| m.is_default)
            .or_else(|| self.models.first())
    }

    /// Look up a served model by id
    #[must_use]
    pub fn model(&self, id: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Whether this provider serves the model
    #[must_use]
    pub fn serves(&self, model_id: &str) -> bool {
        self.model(model_id).is_some()
    }
}

/// Registry of providers, sorted by ascending priority
#[derive(Debug)]
pub struct ProviderRegistry {
    providers: Vec<Arc<Provider>>,
    index: HashMap<String, usize>,
    enabled: RwLock<HashMap<String, bool>>,
}

impl ProviderRegistry {
    /// Build a registry from provider configuration
    #[must_use]
    pub fn from_configs(configs: &[ProviderConfig]) -> Self {
        let enabled = configs
            .iter()
            .map(|c| (c.id.clone(), c.enabled))
            .collect::<HashMap<_, _>>();
        let providers = configs.iter().map(Provider::from_config).collect();
        Self::build(providers, enabled)
    }

    /// Build a registry from already constructed providers, all enabled
    #[must_use]
    pub fn new(providers: Vec<Provider>) -> Self {
        let enabled = providers.iter().map(|p| (p.id.clone(), true)).collect();
        Self::build(providers, enabled)
    }

    fn build(mut providers: Vec<Provider>, enabled: HashMap<String, bool>) -> Self {
        // Stable sort keeps config order for equal priorities
        providers.sort_by_key(|p| p.priority);
        let providers: Vec<Arc<Provider>> = providers.into_iter().map(Arc::new).collect();
        let index = providers
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();

        Self {
            providers,
            index,
            enabled: RwLock::new(enabled),
        }
    }

    /// Wrap in a shared handle
    #[must_use]
    pub fn into_handle(self) -> RegistryHandle {
        Arc::new(self)
    }

    /// All providers in priority order
    #[must_use]
    pub fn list_providers(&self) -> Vec<Arc<Provider>> {
        self.providers.clone()
    }

    /// Look up a provider
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn get_provider(&self, id: &str) -> Result<Arc<Provider>, RegistryError> {
        self.index
            .get(id)
            .map(|&i| Arc::clone(&self.providers[i]))
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Whether a provider with this id exists
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Current value of the manual switch; unknown ids read as disabled
    #[must_use]
    pub fn is_enabled(&self, id: &str) -> bool {
        self.enabled.read().get(id).copied().unwrap_or(false)
    }

    /// Flip the manual switch
    ///
    /// Returns the previous value.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, RegistryError> {
        if !self.contains(id) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        let previous = self
            .enabled
            .write()
            .insert(id.to_string(), enabled)
            .unwrap_or(false);

        if previous != enabled {
            tracing::info!(provider = %id, enabled, "Provider availability changed");
        }
        Ok(previous)
    }

    /// Enabled providers in priority order
    #[must_use]
    pub fn enabled_providers(&self) -> Vec<Arc<Provider>> {
        let enabled = self.enabled.read();
        self.providers
            .iter()
            .filter(|p| enabled.get(&p.id).copied().unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Whether any provider serves the model
    #[must_use]
    pub fn any_serves(&self, model_id: &str) -> bool {
        self.providers.iter().any(|p| p.serves(model_id))
    }

    /// Number of providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
