#![allow(missing_docs)]
//! Provider Routing
//!
//! Selection, admission control and dispatch for chat completions across a
//! small pool of local GPU servers and cloud APIs.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |      Router      |  <-- Entry point for every completion
//! +--------+---------+
//!          |  consults
//!    +-----+-------------+-------------------+
//!    |                   |                   |
//!    v                   v                   v
//! +--------------+ +-----------------+ +----------------+
//! | HealthMonitor| |ConcurrencyTracker| |AdmissionQueue |
//! +--------------+ +-----------------+ +----------------+
//!          |
//!          v
//! +------------------+
//! |    Dispatcher    |  <-- Holds the reservation for the upstream call
//! +--------+---------+
//!          |
//!    +-----+-----+
//!    |           |
//!    v           v
//! +------+   +--------+
//! |Ollama|   | OpenAI |  <-- ProviderBackend implementations
//! +------+   +--------+
//! ```
//!
//! Every decision and upstream outcome is reported through [`MetricsSink`].
//!
//! # Design Principles
//!
//! 1. **Capacity is a hard limit**: a provider never holds more than
//!    `max_concurrent` requests; slots are RAII guards
//! 2. **Priority under contention**: agents before users, FIFO within a tier
//! 3. **Graceful Degradation**: skip unhealthy providers, wait briefly,
//!    optionally fall back to the cloud tier, then fail with `Retry-After`

pub mod admission;
pub mod concurrency;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod metrics;
pub mod policy;
pub mod router;

#[cfg(test)]
pub(crate) mod test_utils;

pub use admission::{AdmissionError, AdmissionQueue};
pub use concurrency::{ConcurrencyTracker, LoadSnapshot, LoadStats, Reservation};
pub use config::*;
pub use dispatcher::{DispatchBody, DispatchError, Dispatched, Dispatcher, ReservedStream};
pub use error::RouterError;
pub use health::{HealthMonitor, HealthState, HealthStatus, ProbeOutcome};
pub use metrics::{prometheus_handle, publish_provider_gauges, MetricsSink, RouterMetrics};
pub use policy::*;
pub use router::{Router, Selection};
