//! Shared tracing/logging initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"streamfork_relay=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Fails if a global subscriber has already been installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<()> {
    let env_filter = std::env::var("RUST_LOG").map_or_else(
        |_| tracing_subscriber::EnvFilter::new(default_filter),
        tracing_subscriber::EnvFilter::new,
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| Error::Tracing(e.to_string()))
}

/// Build the default filter directive for a crate at the given level,
/// e.g. `crate_filter("streamfork_relay", "debug")` -> `"streamfork_relay=debug"`.
pub fn crate_filter(crate_name: &str, level: &str) -> String {
    format!("{crate_name}={level}")
}
