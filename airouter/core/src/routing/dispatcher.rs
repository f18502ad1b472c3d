//! Dispatcher
//!
//! Forwards a request to the provider the router selected, holding the
//! selection's [`Reservation`] until the response is complete. Streamed
//! responses carry the reservation inside [`ReservedStream`], so the slot is
//! returned when the stream ends, fails, times out or is dropped by a
//! disconnecting client.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{Instant, Sleep};

use super::concurrency::Reservation;
use super::error::RouterError;
use super::metrics::MetricsSink;
use super::policy::RoutingDecision;
use super::router::Selection;
use crate::backend::{BackendError, BackendSet, ChunkStream, UpstreamRequest};
use crate::protocol::{ChatCompletionRequest, Usage};

/// A failed dispatch, before mapping to the caller-facing taxonomy
#[derive(Debug, Error)]
#[error("Dispatch to {provider} failed: {source}")]
pub struct DispatchError {
    /// Provider that was called
    pub provider: String,
    /// What went wrong
    #[source]
    pub source: BackendError,
}

/// Successful dispatch
#[derive(Debug)]
pub struct Dispatched {
    /// Provider that served the request
    pub provider: String,
    /// Model that served the request
    pub model: String,
    /// Final routing decision
    pub decision: RoutingDecision,
    /// Response payload
    pub body: DispatchBody,
}

/// Response payload
pub enum DispatchBody {
    /// Whole `chat.completion` object
    Complete(Value),
    /// SSE frames, holding the provider slot until finished
    Stream(ReservedStream),
}

impl std::fmt::Debug for DispatchBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(body) => f.debug_tuple("Complete").field(body).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Sends selected requests to their backends
pub struct Dispatcher {
    backends: BackendSet,
    metrics: Arc<dyn MetricsSink>,
    upstream_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher over the provider backends
    #[must_use]
    pub fn new(backends: BackendSet, metrics: Arc<dyn MetricsSink>, upstream_timeout: Duration) -> Self {
        Self {
            backends,
            metrics,
            upstream_timeout,
        }
    }

    /// Configured upstream timeout
    #[must_use]
    pub fn upstream_timeout(&self) -> Duration {
        self.upstream_timeout
    }

    /// Forward `body` to the selected provider
    ///
    /// # Errors
    ///
    /// Returns the backend failure; the reservation is released before
    /// returning.
    pub async fn dispatch(
        &self,
        selection: Selection,
        body: &ChatCompletionRequest,
        headers: &[(String, String)],
    ) -> Result<Dispatched, DispatchError> {
        let Selection {
            provider,
            model,
            decision,
            reservation,
        } = selection;

        let Some(backend) = self.backends.get(&provider.id) else {
            return Err(DispatchError {
                provider: provider.id.clone(),
                source: BackendError::Unreachable("no backend configured".to_string()),
            });
        };

        let upstream = UpstreamRequest {
            request_id: decision.request_id.clone(),
            model: model.clone(),
            body: body.for_model(&model),
            headers: headers.to_vec(),
        };

        tracing::debug!(
            request_id = %upstream.request_id,
            provider = %provider.id,
            model = %model,
            stream = body.is_stream(),
            "Dispatching request"
        );

        let started = Instant::now();
        let deadline = started + self.upstream_timeout;

        if body.is_stream() {
            let stream = match tokio::time::timeout_at(deadline, backend.stream(&upstream)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(self.fail(&provider.id, &model, started, e)),
                Err(_) => return Err(self.fail(&provider.id, &model, started, BackendError::Timeout)),
            };

            let body = DispatchBody::Stream(ReservedStream {
                inner: stream,
                reservation: Some(reservation),
                deadline: Box::pin(tokio::time::sleep_until(deadline)),
                metrics: Arc::clone(&self.metrics),
                provider: provider.id.clone(),
                model: model.clone(),
                started,
                timeout: self.upstream_timeout,
                pending: Vec::new(),
            });
            return Ok(Dispatched {
                provider: provider.id.clone(),
                model,
                decision,
                body,
            });
        }

        let _reservation = reservation;
        match tokio::time::timeout_at(deadline, backend.complete(&upstream)).await {
            Ok(Ok(completion)) => {
                self.metrics
                    .record_request(&provider.id, &model, "success", started.elapsed());
                if let Some(usage) = completion.usage {
                    self.metrics.record_tokens(&provider.id, &model, &usage);
                }
                Ok(Dispatched {
                    provider: provider.id.clone(),
                    model,
                    decision,
                    body: DispatchBody::Complete(completion.body),
                })
            }
            Ok(Err(e)) => Err(self.fail(&provider.id, &model, started, e)),
            Err(_) => Err(self.fail(&provider.id, &model, started, BackendError::Timeout)),
        }
    }

    fn fail(&self, provider: &str, model: &str, started: Instant, error: BackendError) -> DispatchError {
        let status = if matches!(error, BackendError::Timeout) {
            "timeout"
        } else {
            "error"
        };
        tracing::warn!(
            provider = %provider,
            model = %model,
            kind = error.kind(),
            error = %error,
            "Upstream call failed"
        );
        self.metrics
            .record_request(provider, model, status, started.elapsed());
        DispatchError {
            provider: provider.to_string(),
            source: error,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .field("upstream_timeout", &self.upstream_timeout)
            .finish()
    }
}

// ============================================================================
// Reserved Stream
// ============================================================================

/// Upstream SSE frames bound to a provider slot
///
/// Yields at most one error, after which the stream ends. Usage figures seen
/// in the frames are reported when the stream finishes.
pub struct ReservedStream {
    inner: ChunkStream,
    reservation: Option<Reservation>,
    deadline: Pin<Box<Sleep>>,
    metrics: Arc<dyn MetricsSink>,
    provider: String,
    model: String,
    started: Instant,
    timeout: Duration,
    /// Bytes of an SSE line not yet terminated
    pending: Vec<u8>,
}

impl ReservedStream {
    /// Provider serving the stream
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Whether the provider slot is still held
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.reservation.is_some()
    }

    fn finish(&mut self, status: &str) {
        if let Some(reservation) = self.reservation.take() {
            drop(reservation);
            self.metrics
                .record_request(&self.provider, &self.model, status, self.started.elapsed());
            tracing::debug!(
                provider = %self.provider,
                status,
                elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Stream finished"
            );
        }
    }

    fn observe_usage(&mut self, frame: &[u8]) {
        self.pending.extend_from_slice(frame);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let Some(payload) = line.trim_ascii().strip_prefix(b"data: ") else {
                continue;
            };
            if let Ok(value) = serde_json::from_slice::<Value>(payload) {
                if let Some(usage) = Usage::from_body(&value) {
                    self.metrics.record_tokens(&self.provider, &self.model, &usage);
                }
            }
        }
    }
}

impl Stream for ReservedStream {
    type Item = Result<Bytes, RouterError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.reservation.is_none() {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.observe_usage(&frame);
                return Poll::Ready(Some(Ok(frame)));
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(provider = %this.provider, error = %e, "Stream failed mid-response");
                this.finish("error");
                return Poll::Ready(Some(Err(RouterError::from_backend(
                    &this.provider,
                    e,
                    this.timeout,
                ))));
            }
            Poll::Ready(None) => {
                this.finish("success");
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            tracing::warn!(provider = %this.provider, "Stream exceeded upstream timeout");
            this.finish("timeout");
            return Poll::Ready(Some(Err(RouterError::UpstreamTimeout {
                provider: this.provider.clone(),
                timeout: this.timeout,
            })));
        }

        Poll::Pending
    }
}

impl Drop for ReservedStream {
    fn drop(&mut self) {
        if self.reservation.is_some() {
            tracing::info!(provider = %self.provider, "Client disconnected, releasing slot");
            self.finish("cancelled");
        }
    }
}
