//! Logging initialization for the CLI.
//!
//! Logging is owned by the CLI crate to keep the library free of global
//! subscriber state. Logs go to stderr so stdout stays parseable.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber.
///
/// # Arguments
/// * `verbosity` - 0 = WARN, 1 = INFO, 2 = DEBUG, 3+ = TRACE
/// * `json` - If true, log JSON lines to stderr
///
/// JSON output format (stable contract):
/// ```json
/// {"timestamp":"...","level":"INFO","target":"pakfetch_core::session","span":{"cmd":"extract","spec":"left-pad@1"},"fields":{...}}
/// ```
pub fn init(verbosity: u8, json: bool) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    // RUST_LOG wins for everything but our own crates
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"))
        .add_directive(level_directive("pakfetch_core", level))
        .add_directive(level_directive("pakfetch", level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // A subscriber may already be installed (tests); keep it.
    if json {
        let _ = subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init();
    } else {
        let _ = subscriber
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init();
    }
}

fn level_directive(target: &str, level: Level) -> tracing_subscriber::filter::Directive {
    let fallback = tracing_subscriber::filter::Directive::from(level);
    format!("{target}={level}").parse().unwrap_or(fallback)
}
