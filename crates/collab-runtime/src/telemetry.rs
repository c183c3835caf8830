//! Process-wide log output

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use collab_core::{CollabError, CollabResult};

use crate::LoggingConfig;

/// Target of the records written for the `log` output channel
pub const LOG_TARGET: &str = "collab::log";

/// Filter from `RUST_LOG`, falling back to the configured directive
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LoggingConfig) -> CollabResult<()> {
    let registry = tracing_subscriber::registry().with(env_filter(config));
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.map_err(|e| CollabError::InvalidParameters(format!("tracing: {}", e)))
}
