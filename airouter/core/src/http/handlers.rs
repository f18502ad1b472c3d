//! Request handlers

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{error_body, ApiError};
use super::AppState;
use crate::protocol::{sse_frame, ChatCompletionRequest, PASSTHROUGH_HEADERS};
use crate::registry::Provider;
use crate::routing::{
    publish_provider_gauges, DispatchBody, Dispatched, MetricsSink, RequestPriority,
    RoutingRequest,
};

const PROVIDER_HEADER: &str = "x-provider";
const PRIORITY_HEADER: &str = "x-request-priority";

// ============================================================================
// Chat Completions
// ============================================================================

pub(super) async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let chat: ChatCompletionRequest = serde_json::from_slice(&body).map_err(|e| {
        state.metrics.record_error("invalid_request", None);
        ApiError::bad_request(format!("Invalid request body: {e}"))
    })?;
    if let Err(message) = chat.validate() {
        state.metrics.record_error("invalid_request", None);
        return Err(ApiError::bad_request(message));
    }

    let request = routing_request(&state, &headers, &chat);
    let forwarded = passthrough_headers(&headers);

    tracing::debug!(
        request_id = %request.request_id,
        provider = request.requested_provider.as_deref().unwrap_or("auto"),
        model = request.requested_model.as_deref().unwrap_or("default"),
        priority = request.priority.as_str(),
        stream = chat.is_stream(),
        "Chat completion request"
    );

    let dispatched = state.router.execute(&request, &chat, &forwarded).await?;
    Ok(into_response(dispatched))
}

/// Extract pin, model and priority from the body and headers
///
/// `model = "<provider>/<model>"` pins only when the prefix is a registered
/// provider id, so model names containing `/` pass through untouched.
fn routing_request(state: &AppState, headers: &HeaderMap, chat: &ChatCompletionRequest) -> RoutingRequest {
    let priority = header_str(headers, PRIORITY_HEADER)
        .map(RequestPriority::from_header)
        .unwrap_or_default();
    let mut request = RoutingRequest::new().with_priority(priority);
    let registry = state.router.registry();

    let mut model = chat.requested_model().map(str::to_string);
    let prefixed = chat
        .requested_model()
        .and_then(|m| m.split_once('/'))
        .filter(|(prefix, _)| registry.contains(prefix));
    if let Some((prefix, rest)) = prefixed {
        request = request.with_provider(prefix);
        model = model_hint(rest);
    }

    if let Some(pin) = header_str(headers, PROVIDER_HEADER).filter(|p| !p.is_empty()) {
        request = request.with_provider(pin);
    }
    if let Some(model) = model {
        request = request.with_model(model);
    }
    request
}

fn model_hint(model: &str) -> Option<String> {
    match model.trim() {
        "" | "auto" | "default" => None,
        m => Some(m.to_string()),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn passthrough_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    PASSTHROUGH_HEADERS
        .iter()
        .filter_map(|name| {
            header_str(headers, name).map(|value| ((*name).to_string(), value.to_string()))
        })
        .collect()
}

fn into_response(dispatched: Dispatched) -> Response {
    let Dispatched {
        provider,
        model,
        body,
        ..
    } = dispatched;

    let mut response = match body {
        DispatchBody::Complete(body) => Json(body).into_response(),
        DispatchBody::Stream(stream) => {
            let frames = stream.map(|item| {
                Ok::<_, Infallible>(match item {
                    Ok(frame) => frame,
                    Err(e) => {
                        let status = StatusCode::from_u16(e.status())
                            .unwrap_or(StatusCode::BAD_GATEWAY);
                        let payload = error_body(status, e.code(), &e.to_string());
                        Bytes::from(sse_frame(&payload))
                    }
                })
            });
            let mut response = Response::new(Body::from_stream(frames));
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            response
        }
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&provider) {
        headers.insert("x-airouter-provider", value);
    }
    if let Ok(value) = HeaderValue::from_str(&model) {
        headers.insert("x-airouter-model", value);
    }
    response
}

// ============================================================================
// Models and Providers
// ============================================================================

pub(super) async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let router = &state.router;
    let data: Vec<Value> = router
        .registry()
        .enabled_providers()
        .iter()
        .filter(|p| router.health().is_provider_healthy(&p.id))
        .flat_map(|provider| {
            provider.models.iter().map(move |model| {
                json!({
                    "id": format!("{}/{}", provider.id, model.id),
                    "object": "model",
                    "owned_by": provider.id,
                    "provider": provider.id,
                    "model": model.id,
                    "name": model.name,
                    "is_default": model.is_default,
                    "context_window": model.context_window,
                    "capabilities": model.capabilities,
                })
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

pub(super) async fn list_providers(State(state): State<AppState>) -> Json<Vec<Value>> {
    let views = state
        .router
        .registry()
        .list_providers()
        .iter()
        .map(|p| provider_view(&state, p))
        .collect();
    Json(views)
}

pub(super) async fn enable_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_enabled(&state, &id, true)
}

pub(super) async fn disable_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_enabled(&state, &id, false)
}

fn set_enabled(state: &AppState, id: &str, enabled: bool) -> Result<Json<Value>, ApiError> {
    let registry = state.router.registry();
    let not_found = |_| ApiError::not_found("provider_not_found", format!("Unknown provider '{id}'"));
    registry.set_enabled(id, enabled).map_err(not_found)?;
    let provider = registry.get_provider(id).map_err(not_found)?;
    Ok(Json(provider_view(state, &provider)))
}

fn provider_view(state: &AppState, provider: &Provider) -> Value {
    let router = &state.router;
    let health = router.health().state(&provider.id).unwrap_or_default();
    let load = router.tracker().snapshot(&provider.id).unwrap_or_default();

    json!({
        "id": provider.id,
        "name": provider.name,
        "enabled": router.registry().is_enabled(&provider.id),
        "priority": provider.priority,
        "tier": provider.tier.as_str(),
        "kind": provider.kind.as_str(),
        "health": {
            "is_healthy": health.is_healthy,
            "consecutive_failures": health.consecutive_failures,
            "status": health.status(),
            "last_response_time_ms": health.last_response_time_ms,
            "last_checked": health.last_checked,
            "last_error": health.last_error,
        },
        "load": {
            "current_requests": load.current_requests,
            "max_concurrent": load.max_concurrent,
        },
        "models": provider.models,
    })
}

// ============================================================================
// Observability
// ============================================================================

#[derive(Debug, Deserialize)]
pub(super) struct DecisionsQuery {
    limit: Option<usize>,
}

pub(super) async fn routing_decisions(
    State(state): State<AppState>,
    Query(query): Query<DecisionsQuery>,
) -> Json<Value> {
    let decisions = state.metrics.recent_decisions(query.limit.unwrap_or(50));
    Json(json!({ "decisions": decisions }))
}

pub(super) async fn metrics(State(state): State<AppState>) -> Response {
    let router = &state.router;
    publish_provider_gauges(router.registry(), router.health(), router.tracker());

    let body = state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

pub(super) async fn health(State(state): State<AppState>) -> Json<Value> {
    let router = &state.router;
    let providers = router.registry().list_providers();
    let enabled = providers
        .iter()
        .filter(|p| router.registry().is_enabled(&p.id))
        .count();
    let healthy = providers
        .iter()
        .filter(|p| router.health().is_provider_healthy(&p.id))
        .count();

    Json(json!({
        "status": "ok",
        "providers": providers.len(),
        "enabled": enabled,
        "healthy": healthy,
        "queued": router.queued(),
        "fallback_mode": router.config().fallback_mode.as_str(),
    }))
}
