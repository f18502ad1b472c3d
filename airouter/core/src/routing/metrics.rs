//! Routing Metrics
//!
//! The [`MetricsSink`] interface every routing decision and dispatch outcome
//! is reported through, and [`RouterMetrics`], which exports them in
//! Prometheus format and keeps a short in-memory decision log for the
//! dashboards.

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;

use super::concurrency::ConcurrencyTracker;
use super::health::HealthMonitor;
use super::policy::{FailoverRecord, RoutingDecision};
use crate::protocol::Usage;
use crate::registry::ProviderRegistry;

// ============================================================================
// Sink Interface
// ============================================================================

/// Receiver of routing telemetry
pub trait MetricsSink: Send + Sync {
    /// A routing decision (dispatched, queued or rejected)
    fn record_decision(&self, decision: &RoutingDecision);

    /// A provider passed over in favour of another
    fn record_failover(&self, failover: &FailoverRecord);

    /// A finished upstream call
    fn record_request(&self, provider: &str, model: &str, status: &str, duration: Duration);

    /// An error surfaced to a caller
    fn record_error(&self, error_type: &str, provider: Option<&str>);

    /// Token usage reported by the upstream
    fn record_tokens(&self, provider: &str, model: &str, usage: &Usage);
}

// ============================================================================
// Prometheus Exporter
// ============================================================================

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder once and return its handle
///
/// Returns `None` if another recorder was already installed.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| {
            let duration_buckets = [
                0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0,
            ];
            let installed = PrometheusBuilder::new()
                .set_buckets_for_metric(
                    Matcher::Suffix(String::from("duration_seconds")),
                    &duration_buckets,
                )
                .and_then(PrometheusBuilder::install_recorder);

            match installed {
                Ok(handle) => {
                    describe_metrics();
                    Some(handle)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install Prometheus recorder");
                    None
                }
            }
        })
        .clone()
}

fn describe_metrics() {
    describe_counter!("requests_total", "Upstream calls by provider, model and status");
    describe_histogram!(
        "request_duration_seconds",
        "Upstream call duration, streaming included"
    );
    describe_gauge!("provider_health", "1 healthy, 0.5 degraded, 0 offline");
    describe_gauge!("provider_active_requests", "Requests holding a slot");
    describe_gauge!("provider_max_concurrent", "Configured slot count");
    describe_counter!("routing_decisions_total", "Routing decisions by outcome");
    describe_counter!("failover_total", "Providers skipped in favour of another");
    describe_counter!("errors_total", "Errors surfaced to callers");
    describe_counter!("tokens_total", "Tokens reported by upstreams");
}

/// Refresh per-provider gauges; called right before a scrape
pub fn publish_provider_gauges(
    registry: &ProviderRegistry,
    health: &HealthMonitor,
    tracker: &ConcurrencyTracker,
) {
    for provider in registry.list_providers() {
        let id = provider.id.clone();
        let health_value = health
            .state(&id)
            .map_or(0.0, |s| s.status().gauge_value());
        let load = tracker.snapshot(&id).unwrap_or_default();

        gauge!("provider_health", "provider" => id.clone()).set(health_value);
        gauge!("provider_active_requests", "provider" => id.clone())
            .set(f64::from(load.current_requests));
        gauge!("provider_max_concurrent", "provider" => id).set(f64::from(load.max_concurrent));
    }
}

// ============================================================================
// Router Metrics
// ============================================================================

/// Prometheus export plus a bounded log of recent decisions
pub struct RouterMetrics {
    decisions: Mutex<VecDeque<RoutingDecision>>,
    capacity: usize,
}

impl RouterMetrics {
    /// Keep at most `capacity` recent decisions
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            decisions: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Most recent decisions, oldest first
    #[must_use]
    pub fn recent_decisions(&self, limit: usize) -> Vec<RoutingDecision> {
        let decisions = self.decisions.lock();
        let skip = decisions.len().saturating_sub(limit);
        decisions.iter().skip(skip).cloned().collect()
    }

    /// Failover records across the retained decisions, oldest first
    #[must_use]
    pub fn failovers(&self) -> Vec<FailoverRecord> {
        self.decisions
            .lock()
            .iter()
            .flat_map(|d| d.failovers.iter().cloned())
            .collect()
    }

    /// Decisions recorded for one request, oldest first
    #[must_use]
    pub fn decisions_for(&self, request_id: &str) -> Vec<RoutingDecision> {
        self.decisions
            .lock()
            .iter()
            .filter(|d| d.request_id == request_id)
            .cloned()
            .collect()
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MetricsSink for RouterMetrics {
    fn record_decision(&self, decision: &RoutingDecision) {
        let provider = decision.selected_provider.clone().unwrap_or_default();
        let reason = decision.reason.clone().unwrap_or_default();
        counter!(
            "routing_decisions_total",
            "outcome" => decision.outcome.as_str(),
            "provider" => provider,
            "reason" => reason
        )
        .increment(1);

        let mut decisions = self.decisions.lock();
        if decisions.len() == self.capacity {
            decisions.pop_front();
        }
        decisions.push_back(decision.clone());
    }

    fn record_failover(&self, failover: &FailoverRecord) {
        counter!(
            "failover_total",
            "from_provider" => failover.from_provider.clone(),
            "to_provider" => failover.to_provider.clone(),
            "reason" => failover.reason.as_str()
        )
        .increment(1);
    }

    fn record_request(&self, provider: &str, model: &str, status: &str, duration: Duration) {
        counter!(
            "requests_total",
            "provider" => provider.to_string(),
            "model" => model.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(
            "request_duration_seconds",
            "provider" => provider.to_string(),
            "model" => model.to_string()
        )
        .record(duration.as_secs_f64());
    }

    fn record_error(&self, error_type: &str, provider: Option<&str>) {
        counter!(
            "errors_total",
            "type" => error_type.to_string(),
            "provider" => provider.unwrap_or_default().to_string()
        )
        .increment(1);
    }

    fn record_tokens(&self, provider: &str, model: &str, usage: &Usage) {
        for (kind, count) in [
            ("prompt", usage.prompt_tokens),
            ("completion", usage.completion_tokens),
        ] {
            counter!(
                "tokens_total",
                "provider" => provider.to_string(),
                "model" => model.to_string(),
                "kind" => kind
            )
            .increment(count);
        }
    }
}

impl std::fmt::Debug for RouterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterMetrics")
            .field("retained", &self.decisions.lock().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
