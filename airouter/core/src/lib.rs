//! airouter Core - Request Routing for Local LLM Backends
//!
//! Sits in front of a handful of model servers (single-GPU machines running
//! Ollama or llama.cpp, plus optional cloud APIs) and decides, per request,
//! which provider serves it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  Clients (agents, chat UI, CLI)                  │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  │ OpenAI-compatible HTTP
//! ┌────────────────────────────────┼─────────────────────────────────┐
//! │                           AIROUTER CORE                          │
//! │  ┌─────────────────────────────┴──────────────────────────────┐  │
//! │  │                       http (axum)                          │  │
//! │  └─────────────────────────────┬──────────────────────────────┘  │
//! │  ┌─────────────────────────────┴──────────────────────────────┐  │
//! │  │                         Router                             │  │
//! │  │  ┌──────────┐ ┌─────────────┐ ┌───────────┐ ┌───────────┐  │  │
//! │  │  │ Registry │ │   Health    │ │Concurrency│ │ Admission │  │  │
//! │  │  │          │ │   Monitor   │ │  Tracker  │ │   Queue   │  │  │
//! │  │  └──────────┘ └─────────────┘ └───────────┘ └───────────┘  │  │
//! │  │                       Dispatcher ── MetricsSink            │  │
//! │  └─────────────────────────────┬──────────────────────────────┘  │
//! └────────────────────────────────┼─────────────────────────────────┘
//!                                  │ ProviderBackend
//!               ┌──────────────────┼───────────────────┐
//!               v                  v                   v
//!          ┌─────────┐       ┌───────────┐       ┌───────────┐
//!          │ Ollama  │       │ llama.cpp │       │ Cloud API │
//!          └─────────┘       └───────────┘       └───────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Router`]: selection, admission and dispatch for one request
//! - [`ProviderRegistry`]: configured providers and the manual enable switch
//! - [`HealthMonitor`]: periodic probes and per-provider health
//! - [`ConcurrencyTracker`]: per-provider slot accounting with RAII
//!   [`Reservation`] guards
//! - [`RouterMetrics`]: Prometheus metrics and the recent decision log
//! - [`Stack`]: everything above wired from [`RouterSettings`]
//!
//! # Modules
//!
//! - [`config`]: TOML, environment and CLI configuration
//! - [`registry`]: provider registry
//! - [`routing`]: router, health, concurrency, admission, dispatch, metrics
//! - [`backend`]: Ollama and OpenAI-compatible provider backends
//! - [`protocol`]: OpenAI wire types
//! - [`http`]: the axum application

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod routing;
mod stack;

// Backend exports
pub use backend::{BackendError, BackendSet, ProviderBackend};

// Config exports
pub use config::{
    default_config_path, load_settings, load_settings_from_path, load_settings_with_env,
    ConfigError, ConfigOverrides, ConfigSource, RouterSettings, RouterToml,
};

// HTTP exports
pub use http::{build_app, ApiError, AppState};

// Registry exports
pub use registry::{Model, Provider, ProviderRegistry, RegistryError, RegistryHandle};

// Routing exports
pub use routing::{
    ConcurrencyTracker, FallbackMode, HealthMonitor, MetricsSink, RequestPriority, Reservation,
    Router, RouterConfig, RouterError, RouterMetrics, RoutingDecision, RoutingRequest,
};

// Wiring
pub use stack::Stack;
