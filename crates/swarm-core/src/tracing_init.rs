//! Shared tracing/logging initialization.
//!
//! The daemon binary and the one-shot maintenance commands use the same
//! `tracing_subscriber` setup: an env-filter plus either the human-readable
//! or the JSON formatter.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the env-filter used by [`init_tracing`].
///
/// `RUST_LOG` wins over `default_filter` when it is set.
pub fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Default filter directive for a crate target, e.g. `swarm_daemon=info`.
pub fn crate_filter(target: &str, level: &str) -> String {
    format!("{}={level}", target.replace('-', "_"))
}

/// Install the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"swarm_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<(), TryInitError> {
    let env_filter = env_filter(default_filter);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    }
}
