//! Routing Configuration
//!
//! Configuration types for providers, fallback behaviour, health probing and
//! admission limits. These are plain data; loading and validation live in
//! [`crate::config`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Provider Configuration
// ============================================================================

/// Configuration for one upstream provider
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable identifier (e.g. "gaming-pc-3090")
    pub id: String,

    /// Human readable name shown on dashboards
    #[serde(default)]
    pub name: Option<String>,

    /// Lower is tried first
    pub priority: u32,

    /// In-flight request capacity (1 for a single local GPU)
    pub max_concurrent: u32,

    /// Initial value of the manual availability switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether this provider is a local machine or a cloud API
    #[serde(default)]
    pub tier: ProviderTier,

    /// Wire protocol spoken by the provider
    pub kind: ProviderKind,

    /// Base URL, without a trailing `/v1`
    pub base_url: String,

    /// Environment variable holding the bearer key, if the provider needs one
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Path probed by the health monitor (defaults per kind)
    #[serde(default)]
    pub health_path: Option<String>,

    /// Models served by this provider, in display order
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl ProviderConfig {
    /// Health probe path, falling back to the kind's default
    #[must_use]
    pub fn health_path(&self) -> &str {
        self.health_path
            .as_deref()
            .unwrap_or_else(|| self.kind.default_health_path())
    }
}

fn default_true() -> bool {
    true
}

/// Configuration for a model served by a provider
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Identifier sent upstream (e.g. "qwen2.5-coder:14b")
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Context window in tokens
    #[serde(default)]
    pub context_window: Option<u32>,

    /// Capabilities such as "vision" or "tools"
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Whether requests without an explicit model use this one
    #[serde(default)]
    pub is_default: bool,
}

/// Wire protocol of a provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Ollama native API (`/api/chat`, NDJSON streaming)
    Ollama,
    /// OpenAI-compatible API (llama.cpp server, vLLM, cloud vendors)
    #[serde(alias = "openai-compatible")]
    OpenAi,
}

impl ProviderKind {
    /// Default health probe path for this kind
    #[must_use]
    pub fn default_health_path(&self) -> &'static str {
        match self {
            Self::Ollama => "/api/tags",
            Self::OpenAi => "/v1/models",
        }
    }

    /// Label used in logs and the admin API
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
        }
    }
}

/// Provider tier, used by cloud-fallback mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTier {
    /// A machine on the local network
    #[default]
    Local,
    /// A hosted API with effectively unbounded capacity
    Cloud,
}

impl ProviderTier {
    /// Label used in logs and the admin API
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }
}

// ============================================================================
// Router Behaviour
// ============================================================================

/// What happens when every local candidate is saturated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackMode {
    /// Wait in the admission queue, then reject
    #[default]
    LocalOnly,
    /// Move on to cloud-tier providers
    CloudFallback,
}

impl FallbackMode {
    /// Label used in logs and config
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalOnly => "local-only",
            Self::CloudFallback => "cloud-fallback",
        }
    }
}

impl std::str::FromStr for FallbackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local-only" | "local_only" | "local" => Ok(Self::LocalOnly),
            "cloud-fallback" | "cloud_fallback" | "cloud" => Ok(Self::CloudFallback),
            other => Err(format!("unknown fallback mode: {other}")),
        }
    }
}

/// Selection, admission and dispatch settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Local-only or cloud-fallback
    pub fallback_mode: FallbackMode,

    /// How long a request may wait in the admission queue
    pub admission_timeout_ms: u64,

    /// Coarse re-evaluation interval while waiting
    pub admission_poll_interval_ms: u64,

    /// Value of the `Retry-After` header on 503 responses
    pub retry_after_secs: u64,

    /// Upper bound on a single upstream call, streaming included
    pub upstream_timeout_ms: u64,

    /// Automatic re-routes after a dispatch-time connection failure (0 or 1)
    pub max_reroutes: u32,

    /// Recent routing decisions kept in memory
    pub decision_log_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fallback_mode: FallbackMode::LocalOnly,
            admission_timeout_ms: 5_000,       // 5s bounded wait
            admission_poll_interval_ms: 200,
            retry_after_secs: 5,
            upstream_timeout_ms: 300_000,      // 5min, generation can be slow
            max_reroutes: 1,
            decision_log_capacity: 256,
        }
    }
}

impl RouterConfig {
    /// Admission wait as a Duration
    #[must_use]
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    /// Admission poll interval as a Duration
    #[must_use]
    pub fn admission_poll_interval(&self) -> Duration {
        Duration::from_millis(self.admission_poll_interval_ms.max(1))
    }

    /// Upstream timeout as a Duration
    #[must_use]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// Retry-After hint as a Duration
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs.max(1))
    }
}

// ============================================================================
// Health Probing
// ============================================================================

/// Health monitor settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Time between probe cycles
    pub interval_secs: u64,

    /// Timeout for a single probe
    pub probe_timeout_ms: u64,

    /// Consecutive failures before a provider is marked unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            probe_timeout_ms: 5_000,
            failure_threshold: 3,
        }
    }
}

impl HealthConfig {
    /// Probe interval as a Duration
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Probe timeout as a Duration
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ============================================================================
// HTTP Server
// ============================================================================

/// Listener settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP surface binds to
    pub bind: String,

    /// Environment variable holding the API key clients must present
    pub api_key_env: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            api_key_env: None,
        }
    }
}
