//! Router Error Taxonomy
//!
//! Every failure a caller can see. Each variant knows its wire code, HTTP
//! status and whether it carries a `Retry-After` hint.

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced to callers
#[derive(Debug, Error)]
pub enum RouterError {
    /// No healthy, enabled candidate existed at selection time
    #[error("{message}")]
    ProviderUnavailable {
        /// Which providers were considered
        message: String,
        /// Hint for the `Retry-After` header
        retry_after: Duration,
    },

    /// Candidates existed but stayed saturated
    #[error("All candidate providers are at capacity")]
    ProviderCapacityExceeded {
        /// Hint for the `Retry-After` header
        retry_after: Duration,
    },

    /// Local and cloud tiers are both exhausted
    #[error("No providers available in any tier")]
    NoProvidersAvailable {
        /// Hint for the `Retry-After` header
        retry_after: Duration,
    },

    /// Slot reserved, backend too slow
    #[error("Provider {provider} did not respond within {}s", .timeout.as_secs())]
    UpstreamTimeout {
        /// Provider that timed out
        provider: String,
        /// Configured upstream timeout
        timeout: Duration,
    },

    /// Backend answered with an error or could not be reached
    #[error("Provider {provider} failed: {message}")]
    UpstreamError {
        /// Provider that failed
        provider: String,
        /// Upstream status, when one was received
        status: Option<u16>,
        /// Upstream error detail
        message: String,
    },

    /// Malformed request or unknown model
    #[error("{message}")]
    InvalidRequest {
        /// Machine readable code ("invalid_request", "model_not_found", ...)
        code: &'static str,
        /// Human readable detail
        message: String,
    },
}

impl RouterError {
    /// Malformed request body
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            code: "invalid_request",
            message: message.into(),
        }
    }

    /// Requested model is not served anywhere
    pub fn model_not_found(model: &str) -> Self {
        Self::InvalidRequest {
            code: "model_not_found",
            message: format!("The model '{model}' is not served by any provider"),
        }
    }

    /// Map a backend failure on `provider`
    #[must_use]
    pub fn from_backend(provider: &str, error: BackendError, timeout: Duration) -> Self {
        match error {
            BackendError::Timeout => Self::UpstreamTimeout {
                provider: provider.to_string(),
                timeout,
            },
            BackendError::Status { status, body } => Self::UpstreamError {
                provider: provider.to_string(),
                status: Some(status),
                message: body,
            },
            other => Self::UpstreamError {
                provider: provider.to_string(),
                status: None,
                message: other.to_string(),
            },
        }
    }

    /// Machine readable error code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderCapacityExceeded { .. } => "provider_capacity_exceeded",
            Self::NoProvidersAvailable { .. } => "no_providers_available",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamError { .. } => "upstream_error",
            Self::InvalidRequest { code, .. } => *code,
        }
    }

    /// HTTP status code
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::ProviderUnavailable { .. }
            | Self::ProviderCapacityExceeded { .. }
            | Self::NoProvidersAvailable { .. } => 503,
            Self::UpstreamTimeout { .. } => 504,
            Self::UpstreamError { .. } => 502,
            Self::InvalidRequest { .. } => 400,
        }
    }

    /// `Retry-After` hint; present on every 503
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ProviderUnavailable { retry_after, .. }
            | Self::ProviderCapacityExceeded { retry_after }
            | Self::NoProvidersAvailable { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Provider involved, for metric labels
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::UpstreamTimeout { provider, .. } | Self::UpstreamError { provider, .. } => {
                Some(provider)
            }
            _ => None,
        }
    }
}
