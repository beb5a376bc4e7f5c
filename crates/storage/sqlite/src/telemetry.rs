//! Tracing bootstrap
//!
//! Installs a global `tracing` subscriber with an env-filter and a `fmt`
//! layer, plain or JSON.

use memoria_shared::config::LoggingConfig;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Filter built from the configured level; unparseable directives fall back to `info`.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let registry = tracing_subscriber::registry().with(env_filter(config));

    if config.json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true);
        tracing::subscriber::set_global_default(registry.with(layer))?;
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true);
        tracing::subscriber::set_global_default(registry.with(layer))?;
    }

    info!(level = %config.level, json = config.json, "Tracing initialized");
    Ok(())
}
