//! HTTP Surface
//!
//! OpenAI-compatible endpoints plus the admin API used by the dashboards.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /v1/chat/completions` | Route and forward a completion (JSON or SSE) |
//! | `GET /v1/models` | `provider/model` pairs on enabled, healthy providers |
//! | `GET /providers` | Provider, health and load view |
//! | `POST /providers/:id/enable` | Admin toggle |
//! | `POST /providers/:id/disable` | Admin toggle |
//! | `GET /routing/decisions` | Recent routing decisions |
//! | `GET /metrics` | Prometheus exposition |
//! | `GET /health` | Liveness |

mod error;
mod handlers;

pub use error::{error_body, ApiError};

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::routing::{Router, RouterMetrics};

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    /// Selection, admission and dispatch
    pub router: Arc<Router>,
    /// Decision log and metric emission
    pub metrics: Arc<RouterMetrics>,
    /// Prometheus renderer, absent when no recorder could be installed
    pub prometheus: Option<PrometheusHandle>,
    /// Key clients must present as a bearer token
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    /// State without API key or Prometheus exporter
    #[must_use]
    pub fn new(router: Arc<Router>, metrics: Arc<RouterMetrics>) -> Self {
        Self {
            router,
            metrics,
            prometheus: None,
            api_key: None,
        }
    }

    /// Attach a Prometheus renderer
    #[must_use]
    pub fn with_prometheus(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.prometheus = handle;
        self
    }

    /// Require `Authorization: Bearer <key>`
    #[must_use]
    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.is_empty()).map(Arc::from);
        self
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("router", &self.router)
            .field("prometheus", &self.prometheus.is_some())
            .field("api_key", &self.api_key.is_some())
            .finish()
    }
}

/// Build the axum application
pub fn build_app(state: AppState) -> axum::Router {
    let protected = axum::Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/providers", get(handlers::list_providers))
        .route("/providers/:id/enable", post(handlers::enable_provider))
        .route("/providers/:id/disable", post(handlers::disable_provider))
        .route("/routing/decisions", get(handlers::routing_decisions))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    axum::Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(expected) {
        next.run(request).await
    } else {
        tracing::debug!(path = %request.uri().path(), "Rejected request without valid API key");
        ApiError::unauthorized().into_response()
    }
}
