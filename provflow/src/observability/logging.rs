//! Subscriber installation for the `tracing` ecosystem.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs a global `tracing` subscriber built from `config`.
///
/// `RUST_LOG` overrides the configured filter when set. Returns `false` if a
/// global subscriber was already installed (the call is then a no-op).
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::debug!(filter = %config.filter, json = config.json, "Logging initialised");
    }
    installed
}
