//! Provider Health Monitoring
//!
//! A periodic probe loop keeps a per-provider [`HealthState`]:
//!
//! ```text
//!            success                    failure (< threshold)
//!   +----------------------+        +------------------------+
//!   v                      |        v                        |
//! +---------+  failure  +----------+  failure (>= threshold)  +---------+
//! | Healthy | --------> | Degraded | -----------------------> | Offline |
//! +---------+           +----------+                          +---------+
//!      ^                                                           |
//!      +-------------------------- success ------------------------+
//! ```
//!
//! The probe loop is the only writer. The request path reads through
//! [`HealthMonitor::is_provider_healthy`], which never waits on a probe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::config::HealthConfig;
use crate::backend::BackendSet;
use crate::registry::RegistryHandle;

// ============================================================================
// Health State
// ============================================================================

/// Coarse health classification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Last probe succeeded
    Healthy,
    /// Recent failures, still below the threshold
    Degraded,
    /// Threshold crossed, excluded from routing
    Offline,
}

impl HealthStatus {
    /// Gauge value for `provider_health`
    #[must_use]
    pub fn gauge_value(&self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.5,
            Self::Offline => 0.0,
        }
    }
}

/// Health of one provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthState {
    /// Whether the router may select this provider
    pub is_healthy: bool,
    /// Failed probes since the last success, capped at the failure threshold
    pub consecutive_failures: u32,
    /// Latency of the latest successful probe
    pub last_response_time_ms: Option<u64>,
    /// When the latest probe finished
    pub last_checked: Option<DateTime<Utc>>,
    /// Error of the latest failed probe
    pub last_error: Option<String>,
}

impl Default for HealthState {
    /// Providers start healthy so traffic flows before the first probe
    fn default() -> Self {
        Self {
            is_healthy: true,
            consecutive_failures: 0,
            last_response_time_ms: None,
            last_checked: None,
            last_error: None,
        }
    }
}

impl HealthState {
    /// Coarse classification
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        if !self.is_healthy {
            HealthStatus::Offline
        } else if self.consecutive_failures > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Result of one probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Provider answered with 2xx
    Success {
        /// Probe latency
        response_time_ms: u64,
    },
    /// Timeout, connection error or non-2xx
    Failure {
        /// What went wrong
        error: String,
    },
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Probes providers and owns their [`HealthState`]
pub struct HealthMonitor {
    registry: RegistryHandle,
    backends: BackendSet,
    states: DashMap<String, HealthState>,
    config: HealthConfig,
}

impl HealthMonitor {
    /// Create a monitor; every registered provider starts healthy
    #[must_use]
    pub fn new(registry: RegistryHandle, backends: BackendSet, config: HealthConfig) -> Self {
        let states = registry
            .list_providers()
            .iter()
            .map(|p| (p.id.clone(), HealthState::default()))
            .collect();

        Self {
            registry,
            backends,
            states,
            config,
        }
    }

    /// Monitor configuration
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Whether the router may select the provider
    ///
    /// Unknown providers are never healthy.
    #[must_use]
    pub fn is_provider_healthy(&self, provider_id: &str) -> bool {
        self.states
            .get(provider_id)
            .is_some_and(|state| state.is_healthy)
    }

    /// Health of one provider
    #[must_use]
    pub fn state(&self, provider_id: &str) -> Option<HealthState> {
        self.states.get(provider_id).map(|s| s.clone())
    }

    /// Health of every provider, keyed by id
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, HealthState> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Apply one probe result
    pub fn record_probe(&self, provider_id: &str, outcome: ProbeOutcome) {
        let Some(mut state) = self.states.get_mut(provider_id) else {
            tracing::warn!(provider = %provider_id, "Probe result for unknown provider");
            return;
        };
        let was_healthy = state.is_healthy;
        state.last_checked = Some(Utc::now());

        match outcome {
            ProbeOutcome::Success { response_time_ms } => {
                state.is_healthy = true;
                state.consecutive_failures = 0;
                state.last_response_time_ms = Some(response_time_ms);
                state.last_error = None;

                if !was_healthy {
                    tracing::info!(
                        provider = %provider_id,
                        response_time_ms,
                        "Provider recovered - marked healthy"
                    );
                }
            }
            ProbeOutcome::Failure { error } => {
                // Capped at the threshold so an offline provider's state is stable
                state.consecutive_failures = state
                    .consecutive_failures
                    .saturating_add(1)
                    .min(self.config.failure_threshold);
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.is_healthy = false;
                }

                if was_healthy && !state.is_healthy {
                    tracing::warn!(
                        provider = %provider_id,
                        consecutive_failures = state.consecutive_failures,
                        error = %error,
                        "Provider marked unhealthy"
                    );
                } else {
                    tracing::debug!(
                        provider = %provider_id,
                        consecutive_failures = state.consecutive_failures,
                        error = %error,
                        "Health probe failed"
                    );
                }
                state.last_error = Some(error);
            }
        }
    }

    /// Probe every provider concurrently and apply the results
    ///
    /// Disabled providers are probed too so their state is current when they
    /// are switched back on.
    pub async fn run_probe_cycle(&self) {
        let probes = self.registry.list_providers().into_iter().map(|provider| {
            let backend = self.backends.get(&provider.id).cloned();
            let timeout = self.config.probe_timeout();
            async move {
                let outcome = match backend {
                    Some(backend) => {
                        let start = Instant::now();
                        match tokio::time::timeout(timeout, backend.probe()).await {
                            Ok(Ok(())) => ProbeOutcome::Success {
                                response_time_ms: u64::try_from(start.elapsed().as_millis())
                                    .unwrap_or(u64::MAX),
                            },
                            Ok(Err(e)) => ProbeOutcome::Failure {
                                error: e.to_string(),
                            },
                            Err(_) => ProbeOutcome::Failure {
                                error: format!("probe timed out after {}ms", timeout.as_millis()),
                            },
                        }
                    }
                    None => ProbeOutcome::Failure {
                        error: "no backend configured".to_string(),
                    },
                };
                (provider.id.clone(), outcome)
            }
        });

        for (provider_id, outcome) in futures::future::join_all(probes).await {
            self.record_probe(&provider_id, outcome);
        }
    }

    /// Run the probe loop until `shutdown` flips to true
    ///
    /// The first cycle runs immediately.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                interval_secs = self.config.interval().as_secs(),
                failure_threshold = self.config.failure_threshold,
                "Health monitor started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => self.run_probe_cycle().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Health monitor stopped");
        })
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("states", &self.snapshot())
            .finish()
    }
}
