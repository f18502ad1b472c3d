//! Routing Requests and Decisions
//!
//! The value types that flow into and out of the [`Router`](super::Router).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

// ============================================================================
// Routing Request
// ============================================================================

/// Scheduling priority of a request
///
/// Ordered so that `Agent > User`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    /// Interactive chat from a person
    #[default]
    User,
    /// Automated agent traffic, served first under contention
    Agent,
}

impl RequestPriority {
    /// Parse a header value; anything unrecognised is `User`
    #[must_use]
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "agent" | "high" => Self::Agent,
            _ => Self::User,
        }
    }

    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }
}

/// One inbound call, as seen by the router
#[derive(Clone, Debug)]
pub struct RoutingRequest {
    /// Unique request ID
    pub request_id: String,

    /// Explicit provider pin
    pub requested_provider: Option<String>,

    /// Explicit model
    pub requested_model: Option<String>,

    /// Agent or user
    pub priority: RequestPriority,

    /// When the request reached the router
    pub arrival_time: Instant,
}

impl Default for RoutingRequest {
    fn default() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            requested_provider: None,
            requested_model: None,
            priority: RequestPriority::User,
            arrival_time: Instant::now(),
        }
    }
}

impl RoutingRequest {
    /// Create a request arriving now
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin to a provider
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.requested_provider = Some(provider.into());
        self
    }

    /// Request a model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.requested_model = Some(model.into());
        self
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the caller pinned a provider
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.requested_provider.is_some()
    }
}

// ============================================================================
// Routing Decision
// ============================================================================

/// What the router did with a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionOutcome {
    /// A slot was reserved
    Dispatched,
    /// Waiting in the admission queue
    Queued,
    /// Turned away
    Rejected,
}

impl DecisionOutcome {
    /// Label used in metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Queued => "queued",
            Self::Rejected => "rejected",
        }
    }
}

/// Why a higher-priority provider was passed over
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Health monitor reports it offline
    Unhealthy,
    /// Manually switched off
    Disabled,
    /// Every slot in use (or promised to a queued request)
    Saturated,
    /// Upstream could not be reached at dispatch time
    DispatchFailed,
}

impl SkipReason {
    /// Label used in metrics and the decision log
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unhealthy => "unhealthy",
            Self::Disabled => "disabled",
            Self::Saturated => "saturated",
            Self::DispatchFailed => "dispatch_failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider that was passed over in favour of another
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailoverRecord {
    /// Provider that was skipped
    pub from_provider: String,
    /// Provider that got the request
    pub to_provider: String,
    /// Why `from_provider` was skipped
    pub reason: SkipReason,
}

/// Output of the router for one request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    /// Request this decision belongs to
    pub request_id: String,
    /// Provider chosen (dispatched only)
    pub selected_provider: Option<String>,
    /// Model chosen (dispatched only)
    pub selected_model: Option<String>,
    /// Dispatched, queued or rejected
    pub outcome: DecisionOutcome,
    /// Error code for queued/rejected decisions
    pub reason: Option<String>,
    /// Agent or user
    pub priority: RequestPriority,
    /// Providers skipped on the way
    pub failovers: Vec<FailoverRecord>,
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
}

impl RoutingDecision {
    /// A dispatched decision
    #[must_use]
    pub fn dispatched(
        request: &RoutingRequest,
        provider: &str,
        model: &str,
        failovers: Vec<FailoverRecord>,
    ) -> Self {
        Self {
            request_id: request.request_id.clone(),
            selected_provider: Some(provider.to_string()),
            selected_model: Some(model.to_string()),
            outcome: DecisionOutcome::Dispatched,
            reason: None,
            priority: request.priority,
            failovers,
            timestamp: Utc::now(),
        }
    }

    /// A queued decision
    #[must_use]
    pub fn queued(request: &RoutingRequest, reason: &str) -> Self {
        Self {
            request_id: request.request_id.clone(),
            selected_provider: None,
            selected_model: None,
            outcome: DecisionOutcome::Queued,
            reason: Some(reason.to_string()),
            priority: request.priority,
            failovers: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// A rejected decision
    #[must_use]
    pub fn rejected(request: &RoutingRequest, reason: &str) -> Self {
        Self {
            outcome: DecisionOutcome::Rejected,
            ..Self::queued(request, reason)
        }
    }
}
