//! Tracing subscriber setup for binaries and tests embedding the engine.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the caller.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn filter_or(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Installs a human-readable subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Returns false if a
/// global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter_or(default_filter))
        .try_init()
        .is_ok()
}

/// Installs a subscriber that writes one JSON object per event.
///
/// Returns false if a global subscriber was already installed.
pub fn init_json_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer().json().with_current_span(true))
        .with(filter_or(default_filter))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_false() {
        let _ = init_tracing("stepgraph=debug");
        assert!(!init_json_tracing("stepgraph=debug"));
    }
}
