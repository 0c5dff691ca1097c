//! Centralised tracing initialisation for forgeflow binaries.
//!
//! Call [`init_tracing`] once at program start to configure the global
//! subscriber with an `EnvFilter` and optional JSON formatting. Later calls
//! are ignored.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// * `json` - emit newline-delimited JSON log lines.
/// * `level` - default verbosity when `RUST_LOG` is not set.
/// * `ansi` - colourise human-readable output (follows `CARGO_TERM_COLOR`).
///
/// Logs go to stderr so step output printed on stdout stays clean.
pub fn init_tracing(json: bool, level: Level, ansi: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(ansi)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    }
}

/// Whether a `CARGO_TERM_COLOR` value asks for colour on a terminal.
pub fn color_enabled(term_color: &str, is_terminal: bool) -> bool {
    match term_color {
        "always" => true,
        "never" => false,
        _ => is_terminal,
    }
}
