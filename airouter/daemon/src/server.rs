//! Daemon Server Implementation
//!
//! Loads configuration, wires the router components, binds the TCP listener
//! and serves the axum app until the shutdown channel flips.
//!
//! ```text
//!   RouterSettings ──> Stack ──┬──> HealthMonitor loop (spawned)
//!                              └──> AppState ──> axum::serve
//!                                                    │
//!                      watch<bool> shutdown ─────────┴──> both stop
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use airouter_core::{build_app, load_settings, load_settings_from_path, ConfigOverrides, Stack};

/// Run the router until `shutdown` becomes true
pub async fn run(
    config_path: Option<&Path>,
    overrides: &ConfigOverrides,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut settings = match config_path {
        Some(path) => load_settings_from_path(Some(path), true),
        None => load_settings(),
    }
    .context("Failed to load configuration")?;
    overrides.apply(&mut settings);
    settings.validate().context("Invalid configuration")?;

    info!(
        source = %settings.source(),
        config_file = ?settings.config_file_path,
        providers = settings.providers.len(),
        "Configuration loaded"
    );

    let api_key = settings.server.api_key_env.as_deref().and_then(|var| {
        let key = std::env::var(var).ok().filter(|k| !k.is_empty());
        if key.is_none() {
            warn!(env = var, "API key variable not set, authentication disabled");
        }
        key
    });

    let stack = Stack::from_settings(&settings).context("Failed to create provider backends")?;
    let health_task = std::sync::Arc::clone(&stack.health).spawn(shutdown.clone());
    let app = build_app(stack.app_state(api_key));

    let listener = TcpListener::bind(&settings.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.server.bind))?;
    info!(
        addr = %listener.local_addr().context("Listener has no local address")?,
        "Listening for requests"
    );

    let mut shutdown_signal = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // Sender dropped also means shutdown
            let _ = shutdown_signal.wait_for(|stop| *stop).await;
            info!("Shutdown requested, draining connections");
        })
        .await
        .context("HTTP server failed")?;

    if let Err(e) = health_task.await {
        warn!(error = %e, "Health monitor task ended abnormally");
    }
    Ok(())
}
