//! Severity-filtered colour logging.

use tracing_subscriber::EnvFilter;

/// Install a process-wide subscriber that colourises output by severity and
/// drops everything below `level` (`"debug"`, `"info"`, `"warn"`,
/// `"error"`). A `RUST_LOG` environment variable takes precedence.
///
/// Installing twice is harmless; later calls are ignored.
pub fn init_logging(level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(true)
        .try_init();
}
