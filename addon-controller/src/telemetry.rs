//! Log setup for the controller binary
use crate::config::{LogConfig, LogFormat};
use thiserror::Error;
use tracing_subscriber::{
    filter::ParseError, fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter,
};

/// Failures installing the log subscriber
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The configured filter directives are malformed
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    /// A global subscriber was already installed
    #[error("failed to install log subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Build the filter, `RUST_LOG` overriding the configured directives
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(&config.filter)?),
    }
}

/// Install the global subscriber
///
/// Must be called at most once per process.
pub fn init(config: &LogConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(config)?;
    let (json, text) = match config.format {
        LogFormat::Json => (Some(fmt::layer().json()), None),
        LogFormat::Text => (None, Some(fmt::layer())),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()?;
    Ok(())
}
