//! Logging setup for the orchestrator binary

use crate::{Error, Result};
use stockfleet_core::config::LoggingSettings;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` when set. With `json` enabled every event is
/// written as one JSON object per line.
pub fn init_tracing(level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json().with_current_span(false)))
        .with((!json).then(|| fmt::layer().with_target(true)))
        .try_init()
        .map_err(|e| Error::configuration(format!("failed to install tracing subscriber: {}", e)))
}

/// Install the global subscriber from the `[logging]` configuration section
pub fn init_from_settings(settings: &LoggingSettings) -> Result<()> {
    init_tracing(&settings.level, settings.json)
}
