//! TOML Configuration File Support
//!
//! Loads the router settings from `~/.config/airouter/router.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the daemon through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! Settings are read once at startup; there is no hot reload.
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//! api_key_env = "AIROUTER_API_KEY"
//!
//! [routing]
//! fallback_mode = "local-only"
//! admission_timeout_ms = 5000
//!
//! [health]
//! interval_secs = 30
//! failure_threshold = 3
//!
//! [[providers]]
//! id = "gpu-4090"
//! priority = 1
//! max_concurrent = 1
//! kind = "ollama"
//! base_url = "http://192.168.1.20:11434"
//!
//! [[providers.models]]
//! id = "qwen2.5-coder:14b"
//! is_default = true
//!
//! [[providers]]
//! id = "openai"
//! priority = 100
//! max_concurrent = 100
//! tier = "cloud"
//! kind = "openai"
//! base_url = "https://api.openai.com"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [[providers.models]]
//! id = "gpt-4o-mini"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::config::{
    FallbackMode, HealthConfig, ProviderConfig, RouterConfig, ServerConfig,
};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub bind: Option<String>,

    /// Environment variable holding the client API key
    pub api_key_env: Option<String>,
}

/// Routing section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingToml {
    /// "local-only" or "cloud-fallback"
    pub fallback_mode: Option<FallbackMode>,

    /// Admission wait in milliseconds
    pub admission_timeout_ms: Option<u64>,

    /// Admission re-check interval in milliseconds
    pub admission_poll_interval_ms: Option<u64>,

    /// `Retry-After` value in seconds
    pub retry_after_secs: Option<u64>,

    /// Upstream call timeout in milliseconds
    pub upstream_timeout_ms: Option<u64>,

    /// Automatic re-routes on dispatch failure (clamped to 1)
    pub max_reroutes: Option<u32>,

    /// Routing decisions kept for `/routing/decisions`
    pub decision_log_capacity: Option<usize>,
}

/// Health section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Seconds between probe cycles
    pub interval_secs: Option<u64>,

    /// Probe timeout in milliseconds
    pub probe_timeout_ms: Option<u64>,

    /// Consecutive failures before a provider goes offline
    pub failure_threshold: Option<u32>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    /// Server configuration section
    pub server: ServerToml,

    /// Routing configuration section
    pub routing: RoutingToml,

    /// Health configuration section
    pub health: HealthToml,

    /// Provider list
    pub providers: Vec<ProviderConfig>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Effective router configuration
///
/// Use [`load_settings`] to load it with proper priority handling, then
/// [`RouterSettings::validate`] once CLI overrides are applied.
#[derive(Clone, Debug)]
pub struct RouterSettings {
    /// Listener settings
    pub server: ServerConfig,

    /// Selection and admission settings
    pub routing: RouterConfig,

    /// Health probing settings
    pub health: HealthConfig,

    /// Configured providers
    pub providers: Vec<ProviderConfig>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            routing: RouterConfig::default(),
            health: HealthConfig::default(),
            providers: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RouterSettings {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::Validation(
                "at least one [[providers]] entry is required".to_string(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            let id = provider.id.trim();
            if id.is_empty() {
                return Err(ConfigError::Validation("provider id must not be empty".to_string()));
            }
            if !seen.insert(id) {
                return Err(ConfigError::Validation(format!("duplicate provider id '{id}'")));
            }
            if provider.max_concurrent == 0 {
                return Err(ConfigError::Validation(format!(
                    "provider '{id}': max_concurrent must be at least 1"
                )));
            }
            if provider.base_url.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "provider '{id}': base_url must not be empty"
                )));
            }
            if provider.models.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "provider '{id}': at least one model is required"
                )));
            }
            if provider.models.iter().filter(|m| m.is_default).count() > 1 {
                return Err(ConfigError::Validation(format!(
                    "provider '{id}': more than one default model"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/airouter/router.toml` or
/// `~/.config/airouter/router.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("airouter").join("router.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing default config file is not an error (defaults are used).
pub fn load_settings() -> Result<RouterSettings, ConfigError> {
    load_settings_from_path(default_config_path().as_deref(), false)
}

/// Load configuration from a specific path and the process environment
///
/// When `required` is set, a missing file is an error.
///
/// # Errors
///
/// Returns an error if the config file cannot be read or parsed.
pub fn load_settings_from_path(
    path: Option<&Path>,
    required: bool,
) -> Result<RouterSettings, ConfigError> {
    load_settings_with_env(path, required, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Returns an error if the config file cannot be read or parsed.
pub fn load_settings_with_env(
    path: Option<&Path>,
    required: bool,
    env: impl Fn(&str) -> Option<String>,
) -> Result<RouterSettings, ConfigError> {
    let mut settings = RouterSettings::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::Read {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            let toml_config: RouterToml = toml::from_str(&content)?;
            apply_toml_config(&mut settings, toml_config);
            settings.config_file_path = Some(config_path.to_path_buf());
            settings.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                providers = settings.providers.len(),
                "Loaded configuration from file"
            );
        } else if required {
            return Err(ConfigError::Read {
                path: config_path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut settings, env);

    Ok(settings)
}

/// Apply TOML configuration values to the settings
fn apply_toml_config(settings: &mut RouterSettings, toml: RouterToml) {
    // Server settings
    if let Some(bind) = toml.server.bind {
        settings.server.bind = bind;
    }
    if toml.server.api_key_env.is_some() {
        settings.server.api_key_env = toml.server.api_key_env;
    }

    // Routing settings
    let routing = &mut settings.routing;
    if let Some(mode) = toml.routing.fallback_mode {
        routing.fallback_mode = mode;
    }
    if let Some(ms) = toml.routing.admission_timeout_ms {
        routing.admission_timeout_ms = ms;
    }
    if let Some(ms) = toml.routing.admission_poll_interval_ms {
        routing.admission_poll_interval_ms = ms;
    }
    if let Some(secs) = toml.routing.retry_after_secs {
        routing.retry_after_secs = secs;
    }
    if let Some(ms) = toml.routing.upstream_timeout_ms {
        routing.upstream_timeout_ms = ms;
    }
    if let Some(n) = toml.routing.max_reroutes {
        routing.max_reroutes = n.min(1);
    }
    if let Some(n) = toml.routing.decision_log_capacity {
        routing.decision_log_capacity = n;
    }

    // Health settings
    if let Some(secs) = toml.health.interval_secs {
        settings.health.interval_secs = secs;
    }
    if let Some(ms) = toml.health.probe_timeout_ms {
        settings.health.probe_timeout_ms = ms;
    }
    if let Some(n) = toml.health.failure_threshold {
        settings.health.failure_threshold = n;
    }

    settings.providers = toml.providers;
}

/// Apply environment variable overrides to the settings
fn apply_env_config(settings: &mut RouterSettings, env: impl Fn(&str) -> Option<String>) {
    if let Some(bind) = env("AIROUTER_BIND") {
        settings.server.bind = bind;
        settings.source = ConfigSource::Env;
    }
    if let Some(mode) = env("AIROUTER_FALLBACK_MODE") {
        match mode.parse::<FallbackMode>() {
            Ok(mode) => {
                settings.routing.fallback_mode = mode;
                settings.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring AIROUTER_FALLBACK_MODE"),
        }
    }
    if let Some(ms) = parse_env::<u64>(&env, "AIROUTER_ADMISSION_TIMEOUT_MS") {
        settings.routing.admission_timeout_ms = ms;
        settings.source = ConfigSource::Env;
    }
    if let Some(secs) = parse_env::<u64>(&env, "AIROUTER_HEALTH_INTERVAL_SECS") {
        settings.health.interval_secs = secs;
        settings.source = ConfigSource::Env;
    }
    if let Some(ms) = parse_env::<u64>(&env, "AIROUTER_UPSTREAM_TIMEOUT_MS") {
        settings.routing.upstream_timeout_ms = ms;
        settings.source = ConfigSource::Env;
    }
}

fn parse_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Values given on the command line, applied last
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind: Option<String>,

    /// Fallback mode override
    pub fallback_mode: Option<FallbackMode>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_bind(mut self, bind: String) -> Self {
        self.bind = Some(bind);
        self
    }

    /// Set fallback mode override
    #[must_use]
    pub fn with_fallback_mode(mut self, mode: FallbackMode) -> Self {
        self.fallback_mode = Some(mode);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, settings: &mut RouterSettings) {
        if self.bind.is_some() || self.fallback_mode.is_some() {
            settings.source = ConfigSource::Cli;
        }
        if let Some(ref bind) = self.bind {
            settings.server.bind = bind.clone();
        }
        if let Some(mode) = self.fallback_mode {
            settings.routing.fallback_mode = mode;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
