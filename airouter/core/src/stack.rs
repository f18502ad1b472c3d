//! Component wiring
//!
//! Builds the registry, backends, health monitor, tracker, metrics and router
//! from [`RouterSettings`] in dependency order.

use std::sync::Arc;

use crate::backend::{build_backends, BackendError, BackendSet};
use crate::config::RouterSettings;
use crate::http::AppState;
use crate::registry::{ProviderRegistry, RegistryHandle};
use crate::routing::{
    prometheus_handle, ConcurrencyTracker, HealthMonitor, MetricsSink, Router, RouterMetrics,
};

/// A fully wired router
#[derive(Clone, Debug)]
pub struct Stack {
    /// Provider registry
    pub registry: RegistryHandle,
    /// Health monitor; spawn its loop with [`HealthMonitor::spawn`]
    pub health: Arc<HealthMonitor>,
    /// Router
    pub router: Arc<Router>,
    /// Metrics sink and decision log
    pub metrics: Arc<RouterMetrics>,
}

impl Stack {
    /// Wire everything with HTTP backends built from the provider config
    ///
    /// # Errors
    ///
    /// Fails if a backend HTTP client cannot be created.
    pub fn from_settings(settings: &RouterSettings) -> Result<Self, BackendError> {
        let registry = ProviderRegistry::from_configs(&settings.providers).into_handle();
        let backends = build_backends(&registry)?;
        Ok(Self::with_backends(settings, registry, backends))
    }

    /// Wire everything over the given backends
    #[must_use]
    pub fn with_backends(
        settings: &RouterSettings,
        registry: RegistryHandle,
        backends: BackendSet,
    ) -> Self {
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            backends.clone(),
            settings.health.clone(),
        ));
        let tracker = Arc::new(ConcurrencyTracker::new(&registry));
        let metrics = Arc::new(RouterMetrics::new(settings.routing.decision_log_capacity));
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            tracker,
            backends,
            Arc::clone(&metrics) as Arc<dyn MetricsSink>,
            settings.routing.clone(),
        ));

        tracing::info!(
            providers = registry.len(),
            fallback_mode = settings.routing.fallback_mode.as_str(),
            admission_timeout_ms = settings.routing.admission_timeout_ms,
            "Router wired"
        );

        Self {
            registry,
            health,
            router,
            metrics,
        }
    }

    /// HTTP state for [`crate::build_app`]
    ///
    /// Installs the global Prometheus recorder on first use.
    #[must_use]
    pub fn app_state(&self, api_key: Option<String>) -> AppState {
        AppState::new(Arc::clone(&self.router), Arc::clone(&self.metrics))
            .with_prometheus(prometheus_handle())
            .with_api_key(api_key)
    }
}
