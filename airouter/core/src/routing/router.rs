//! Router
//!
//! Picks a provider and model for each request, reserves a slot on it and
//! hands the request to the [`Dispatcher`]. Selection walks providers in
//! priority order, skipping unhealthy, disabled and saturated ones, then
//! either waits in the [`AdmissionQueue`] (local-only mode, pinned requests)
//! or falls back to the cloud tier.
//!
//! A provider that turns out to be unreachable at dispatch time is excluded
//! and the request is routed once more, immediately. Any further failure is
//! returned to the caller.

use std::sync::Arc;

use super::admission::AdmissionQueue;
use super::concurrency::{ConcurrencyTracker, Reservation};
use super::config::{FallbackMode, ProviderTier, RouterConfig};
use super::dispatcher::{Dispatched, Dispatcher};
use super::error::RouterError;
use super::health::HealthMonitor;
use super::metrics::MetricsSink;
use super::policy::{FailoverRecord, RoutingDecision, RoutingRequest, SkipReason};
use crate::backend::BackendSet;
use crate::protocol::ChatCompletionRequest;
use crate::registry::{Provider, RegistryHandle};

/// A provider chosen for a request, with its slot already reserved
#[derive(Debug)]
pub struct Selection {
    /// Selected provider
    pub provider: Arc<Provider>,
    /// Upstream model id
    pub model: String,
    /// Dispatched decision, failovers included
    pub decision: RoutingDecision,
    /// Slot on `provider`, released when dropped
    pub reservation: Reservation,
}

#[derive(Clone, Debug)]
struct Candidate {
    provider: Arc<Provider>,
    model: String,
}

#[derive(Clone, Debug)]
struct Skip {
    provider_id: String,
    reason: SkipReason,
}

impl Skip {
    fn new(provider_id: &str, reason: SkipReason) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            reason,
        }
    }
}

/// Candidates for one request, split by tier
#[derive(Debug, Default)]
struct Plan {
    pinned: bool,
    primary: Vec<Candidate>,
    cloud: Vec<Candidate>,
}

/// Selection engine in front of the dispatcher
pub struct Router {
    registry: RegistryHandle,
    health: Arc<HealthMonitor>,
    tracker: Arc<ConcurrencyTracker>,
    admission: AdmissionQueue,
    dispatcher: Dispatcher,
    metrics: Arc<dyn MetricsSink>,
    config: RouterConfig,
}

impl Router {
    /// Wire the router over shared components
    #[must_use]
    pub fn new(
        registry: RegistryHandle,
        health: Arc<HealthMonitor>,
        tracker: Arc<ConcurrencyTracker>,
        backends: BackendSet,
        metrics: Arc<dyn MetricsSink>,
        config: RouterConfig,
    ) -> Self {
        let admission = AdmissionQueue::new(
            Arc::clone(&tracker),
            Arc::clone(&registry),
            Arc::clone(&health),
            config.admission_poll_interval(),
        );
        let dispatcher = Dispatcher::new(backends, Arc::clone(&metrics), config.upstream_timeout());

        Self {
            registry,
            health,
            tracker,
            admission,
            dispatcher,
            metrics,
            config,
        }
    }

    /// Provider registry
    #[must_use]
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Health monitor
    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Concurrency tracker
    #[must_use]
    pub fn tracker(&self) -> &Arc<ConcurrencyTracker> {
        &self.tracker
    }

    /// Requests currently waiting for a slot
    #[must_use]
    pub fn queued(&self) -> usize {
        self.admission.len()
    }

    /// Router configuration
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Select a provider and reserve a slot on it
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for unknown models or providers, and the 503 family
    /// when nothing can take the request.
    pub async fn route(&self, request: &RoutingRequest) -> Result<Selection, RouterError> {
        self.select(request, &[], Vec::new()).await
    }

    /// Route, dispatch, and re-route once if the selected provider is
    /// unreachable
    ///
    /// # Errors
    ///
    /// Any [`RouterError`]; every error is also reported to the metrics sink.
    pub async fn execute(
        &self,
        request: &RoutingRequest,
        body: &ChatCompletionRequest,
        headers: &[(String, String)],
    ) -> Result<Dispatched, RouterError> {
        let result = self.execute_inner(request, body, headers).await;
        if let Err(e) = &result {
            self.metrics.record_error(e.code(), e.provider());
        }
        result
    }

    async fn execute_inner(
        &self,
        request: &RoutingRequest,
        body: &ChatCompletionRequest,
        headers: &[(String, String)],
    ) -> Result<Dispatched, RouterError> {
        let mut selection = self.route(request).await?;
        let mut excluded: Vec<String> = Vec::new();
        let max_reroutes = self.config.max_reroutes.min(1);

        loop {
            let provider = selection.provider.id.clone();
            let error = match self.dispatcher.dispatch(selection, body, headers).await {
                Ok(dispatched) => return Ok(dispatched),
                Err(e) => e.source,
            };

            let reroutes = u32::try_from(excluded.len()).unwrap_or(u32::MAX);
            if !error.is_unreachable() || request.is_pinned() || reroutes >= max_reroutes {
                return Err(RouterError::from_backend(
                    &provider,
                    error,
                    self.dispatcher.upstream_timeout(),
                ));
            }

            tracing::warn!(
                request_id = %request.request_id,
                provider = %provider,
                error = %error,
                "Provider unreachable at dispatch, re-routing"
            );
            excluded.push(provider.clone());
            let skipped = vec![Skip::new(&provider, SkipReason::DispatchFailed)];

            selection = match self.select(request, &excluded, skipped).await {
                Ok(next) => next,
                Err(reroute) => {
                    tracing::debug!(
                        request_id = %request.request_id,
                        error = %reroute,
                        "Re-route found no provider"
                    );
                    return Err(RouterError::from_backend(
                        &provider,
                        error,
                        self.dispatcher.upstream_timeout(),
                    ));
                }
            };
        }
    }

    async fn select(
        &self,
        request: &RoutingRequest,
        excluded: &[String],
        mut skipped: Vec<Skip>,
    ) -> Result<Selection, RouterError> {
        let plan = match self.plan(request, excluded) {
            Ok(plan) => plan,
            Err(e) => return Err(self.reject(request, e)),
        };

        let primary = self.eligible(plan.primary, &mut skipped);
        if let Some((candidate, reservation)) = self.reserve_first(request, &primary, &mut skipped) {
            return Ok(self.dispatched(request, candidate, reservation, skipped));
        }

        if plan.pinned || self.config.fallback_mode == FallbackMode::LocalOnly {
            if primary.is_empty() {
                let message = match &request.requested_provider {
                    Some(id) => format!("Provider '{id}' is offline or disabled"),
                    None => "No healthy local provider available".to_string(),
                };
                return Err(self.reject(
                    request,
                    RouterError::ProviderUnavailable {
                        message,
                        retry_after: self.config.retry_after(),
                    },
                ));
            }
            return self.wait_for_slot(request, primary, skipped).await;
        }

        let cloud = self.eligible(plan.cloud, &mut skipped);
        if let Some((candidate, reservation)) = self.reserve_first(request, &cloud, &mut skipped) {
            return Ok(self.dispatched(request, candidate, reservation, skipped));
        }

        let retry_after = self.config.retry_after();
        let error = if cloud.is_empty() {
            RouterError::NoProvidersAvailable { retry_after }
        } else {
            RouterError::ProviderCapacityExceeded { retry_after }
        };
        Err(self.reject(request, error))
    }

    /// Build the ordered candidate lists
    fn plan(&self, request: &RoutingRequest, excluded: &[String]) -> Result<Plan, RouterError> {
        let requested_model = request.requested_model.as_deref();

        if let Some(pin) = &request.requested_provider {
            let provider = self
                .registry
                .get_provider(pin)
                .map_err(|_| RouterError::invalid(format!("Unknown provider '{pin}'")))?;
            let model = match requested_model {
                Some(model) if provider.serves(model) => model.to_string(),
                Some(model) => {
                    return Err(RouterError::InvalidRequest {
                        code: "model_not_found",
                        message: format!("Provider '{pin}' does not serve model '{model}'"),
                    })
                }
                None => provider
                    .default_model()
                    .map(|m| m.id.clone())
                    .ok_or_else(|| RouterError::invalid(format!("Provider '{pin}' has no models")))?,
            };
            return Ok(Plan {
                pinned: true,
                primary: vec![Candidate { provider, model }],
                cloud: Vec::new(),
            });
        }

        if let Some(model) = requested_model {
            if !self.registry.any_serves(model) {
                return Err(RouterError::model_not_found(model));
            }
        }

        let mut plan = Plan::default();
        for provider in self.registry.list_providers() {
            if excluded.contains(&provider.id) {
                continue;
            }
            match provider.tier {
                ProviderTier::Local => {
                    let model = match requested_model {
                        Some(model) if provider.serves(model) => Some(model.to_string()),
                        Some(_) => None,
                        None => provider.default_model().map(|m| m.id.clone()),
                    };
                    if let Some(model) = model {
                        plan.primary.push(Candidate { provider, model });
                    }
                }
                ProviderTier::Cloud => {
                    // Cloud providers stand in with their default model
                    let model = requested_model
                        .filter(|m| provider.serves(m))
                        .map(str::to_string)
                        .or_else(|| provider.default_model().map(|m| m.id.clone()));
                    if let Some(model) = model {
                        plan.cloud.push(Candidate { provider, model });
                    }
                }
            }
        }
        Ok(plan)
    }

    /// Drop disabled and unhealthy candidates, recording why
    fn eligible(&self, candidates: Vec<Candidate>, skipped: &mut Vec<Skip>) -> Vec<Candidate> {
        candidates
            .into_iter()
            .filter(|c| {
                let id = &c.provider.id;
                if !self.registry.is_enabled(id) {
                    skipped.push(Skip::new(id, SkipReason::Disabled));
                    false
                } else if !self.health.is_provider_healthy(id) {
                    skipped.push(Skip::new(id, SkipReason::Unhealthy));
                    false
                } else {
                    true
                }
            })
            .collect()
    }

    /// Reserve on the first candidate with a free slot nobody is queued for
    fn reserve_first(
        &self,
        request: &RoutingRequest,
        candidates: &[Candidate],
        skipped: &mut Vec<Skip>,
    ) -> Option<(Candidate, Reservation)> {
        for candidate in candidates {
            let id = &candidate.provider.id;
            if !self.admission.is_contended(id, request.priority) {
                if let Some(reservation) = self.tracker.reserve(id) {
                    return Some((candidate.clone(), reservation));
                }
            }
            skipped.push(Skip::new(id, SkipReason::Saturated));
        }
        None
    }

    async fn wait_for_slot(
        &self,
        request: &RoutingRequest,
        candidates: Vec<Candidate>,
        skipped: Vec<Skip>,
    ) -> Result<Selection, RouterError> {
        self.record(&RoutingDecision::queued(request, "all_candidates_saturated"));

        let deadline = request.arrival_time + self.config.admission_timeout();
        let ids = candidates.iter().map(|c| c.provider.id.clone()).collect();

        match self.admission.wait(request.priority, ids, deadline).await {
            Ok(reservation) => {
                let granted = candidates
                    .into_iter()
                    .find(|c| c.provider.id == reservation.provider_id());
                let Some(candidate) = granted else {
                    return Err(self.reject(
                        request,
                        RouterError::ProviderUnavailable {
                            message: "Granted provider is no longer a candidate".to_string(),
                            retry_after: self.config.retry_after(),
                        },
                    ));
                };
                tracing::debug!(
                    request_id = %request.request_id,
                    provider = %candidate.provider.id,
                    waited_ms = u64::try_from(request.arrival_time.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Admitted after waiting"
                );
                Ok(self.dispatched(request, candidate, reservation, skipped))
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    priority = request.priority.as_str(),
                    error = %e,
                    "Admission wait expired"
                );
                Err(self.reject(
                    request,
                    RouterError::ProviderCapacityExceeded {
                        retry_after: self.config.retry_after(),
                    },
                ))
            }
        }
    }

    fn dispatched(
        &self,
        request: &RoutingRequest,
        candidate: Candidate,
        reservation: Reservation,
        skipped: Vec<Skip>,
    ) -> Selection {
        let selected = candidate.provider.id.clone();
        let mut failovers: Vec<FailoverRecord> = Vec::new();
        for skip in skipped {
            if skip.provider_id == selected
                || failovers.iter().any(|f| f.from_provider == skip.provider_id)
            {
                continue;
            }
            failovers.push(FailoverRecord {
                from_provider: skip.provider_id,
                to_provider: selected.clone(),
                reason: skip.reason,
            });
        }

        for failover in &failovers {
            tracing::warn!(
                request_id = %request.request_id,
                from_provider = %failover.from_provider,
                to_provider = %failover.to_provider,
                reason = %failover.reason,
                "Failover"
            );
            self.metrics.record_failover(failover);
        }

        let decision = RoutingDecision::dispatched(request, &selected, &candidate.model, failovers);
        self.record(&decision);

        Selection {
            provider: candidate.provider,
            model: candidate.model,
            decision,
            reservation,
        }
    }

    fn reject(&self, request: &RoutingRequest, error: RouterError) -> RouterError {
        self.record(&RoutingDecision::rejected(request, error.code()));
        error
    }

    fn record(&self, decision: &RoutingDecision) {
        tracing::debug!(
            request_id = %decision.request_id,
            outcome = decision.outcome.as_str(),
            provider = decision.selected_provider.as_deref().unwrap_or("-"),
            model = decision.selected_model.as_deref().unwrap_or("-"),
            reason = decision.reason.as_deref().unwrap_or("-"),
            priority = decision.priority.as_str(),
            "Routing decision"
        );
        self.metrics.record_decision(decision);
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("providers", &self.registry.len())
            .field("admission", &self.admission)
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish()
    }
}
