//! Structured logging for conductor.
//!
//! Log levels:
//! - ERROR: permanent task failures, snapshot write failures
//! - WARN: recoverable anomalies (lagging subscribers, heartbeat load mismatch, stale agents)
//! - INFO: lifecycle milestones (startup, shutdown, agent registration, task completion)
//! - DEBUG: scheduling decisions and state transitions
//! - TRACE: per-pass scheduler detail
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.
//! `RUST_LOG` overrides the default filter entirely. Output goes to stderr so
//! that `conductor run --json` keeps stdout machine-readable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";
const JSON_ENV: &str = "CONDUCTOR_LOG_JSON";

/// Initialize logging with the default (info) filter.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_flag(DEBUG_ENV);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug_enabled)));

    let result = if env_flag(JSON_ENV) {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    // A subscriber installed by a test harness or embedding app wins.
    let _ = result;
}

/// Check if debug mode is requested through the environment.
pub fn is_debug() -> bool {
    env_flag(DEBUG_ENV)
}

fn default_filter(debug: bool) -> &'static str {
    if debug {
        "conductor=debug"
    } else {
        "conductor=info"
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
